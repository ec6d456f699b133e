//! Console commands typed by the operator.
//!
//! One command per line, whitespace separated:
//!
//! ```text
//! spawn boat_7 vehicle 10 4 pilot,gunnerPort
//! move 12 6 0.5
//! claim boat_7 [slot]
//! drive boat_7 14 6 0.25
//! seat boat_7 gunnerPort
//! release boat_7 [slot]
//! ```

use glam::Vec3;
use tidemesh_net::{EntityId, GameEvent, Pose, SlotName};
use tidemesh_sync::EntityCategory;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Register an entity locally.
    Spawn {
        /// Entity id.
        entity: EntityId,
        /// Category.
        category: EntityCategory,
        /// Initial position.
        position: Vec3,
        /// Named seats; empty for single-seat entities.
        slots: Vec<SlotName>,
    },
    /// Forget an entity.
    Despawn(EntityId),
    /// Move the local avatar.
    Move(Pose),
    /// Claim a seat. `None` picks the driving slot.
    Claim {
        /// Entity.
        entity: EntityId,
        /// Seat.
        slot: Option<SlotName>,
    },
    /// Leave a seat. `None` picks the seat currently held.
    Release {
        /// Entity.
        entity: EntityId,
        /// Seat.
        slot: Option<SlotName>,
    },
    /// Abandon a pending claim.
    Cancel {
        /// Entity.
        entity: EntityId,
        /// Seat.
        slot: Option<SlotName>,
    },
    /// Move to another seat of the occupied entity.
    Seat {
        /// Entity.
        entity: EntityId,
        /// Target seat.
        to: SlotName,
    },
    /// Move a driven entity.
    Drive {
        /// Entity.
        entity: EntityId,
        /// New pose.
        pose: Pose,
    },
    /// Send a gameplay event to linked peers.
    Event(GameEvent),
    /// Print the session state.
    Status,
    /// Print the command list.
    Help,
    /// Leave.
    Quit,
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// The first word is not a command.
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    /// A required argument is absent.
    #[error("'{command}' needs {what}")]
    Missing {
        /// Command word.
        command: &'static str,
        /// Missing argument.
        what: &'static str,
    },

    /// A number did not parse.
    #[error("'{0}' is not a number")]
    BadNumber(String),

    /// Unknown entity category.
    #[error("unknown category '{0}' (vehicle, tow, mount)")]
    BadCategory(String),
}

/// Usage text for `help`.
pub const HELP: &str = "\
commands:
  spawn <entity> <vehicle|tow|mount> <x> <z> [slot,slot,...]
  despawn <entity>
  move <x> <z> [heading]
  claim <entity> [slot]
  release <entity> [slot]
  cancel <entity> [slot]
  seat <entity> <slot>
  drive <entity> <x> <z> [heading]
  event <kind> [text...]
  status
  quit";

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match word {
        "spawn" => {
            let entity = entity_arg(&args, 0, "spawn")?;
            let category = match arg(&args, 1, "spawn", "a category")? {
                "vehicle" => EntityCategory::Vehicle,
                "tow" => EntityCategory::Tow,
                "mount" => EntityCategory::Mount,
                other => return Err(CommandError::BadCategory(other.to_string())),
            };
            let x = number(arg(&args, 2, "spawn", "x and z")?)?;
            let z = number(arg(&args, 3, "spawn", "x and z")?)?;
            let slots = args
                .get(4)
                .map(|list| {
                    list.split(',')
                        .filter(|s| !s.is_empty())
                        .map(SlotName::new)
                        .collect()
                })
                .unwrap_or_default();
            Command::Spawn {
                entity,
                category,
                position: Vec3::new(x, 0.0, z),
                slots,
            }
        }
        "despawn" => Command::Despawn(entity_arg(&args, 0, "despawn")?),
        "move" => Command::Move(pose_args(&args, 0, "move")?),
        "claim" => Command::Claim {
            entity: entity_arg(&args, 0, "claim")?,
            slot: args.get(1).map(|s| SlotName::new(*s)),
        },
        "release" => Command::Release {
            entity: entity_arg(&args, 0, "release")?,
            slot: args.get(1).map(|s| SlotName::new(*s)),
        },
        "cancel" => Command::Cancel {
            entity: entity_arg(&args, 0, "cancel")?,
            slot: args.get(1).map(|s| SlotName::new(*s)),
        },
        "seat" => Command::Seat {
            entity: entity_arg(&args, 0, "seat")?,
            to: SlotName::new(arg(&args, 1, "seat", "a target slot")?),
        },
        "drive" => Command::Drive {
            entity: entity_arg(&args, 0, "drive")?,
            pose: pose_args(&args, 1, "drive")?,
        },
        "event" => Command::Event(GameEvent {
            kind: arg(&args, 0, "event", "a kind")?.to_string(),
            payload: args.get(1..).unwrap_or_default().join(" ").into_bytes(),
        }),
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn arg<'a>(
    args: &[&'a str],
    index: usize,
    command: &'static str,
    what: &'static str,
) -> Result<&'a str, CommandError> {
    args.get(index)
        .copied()
        .ok_or(CommandError::Missing { command, what })
}

fn entity_arg(args: &[&str], index: usize, command: &'static str) -> Result<EntityId, CommandError> {
    arg(args, index, command, "an entity id").map(EntityId::new)
}

fn number(word: &str) -> Result<f32, CommandError> {
    word.parse()
        .map_err(|_| CommandError::BadNumber(word.to_string()))
}

fn pose_args(args: &[&str], start: usize, command: &'static str) -> Result<Pose, CommandError> {
    let x = number(arg(args, start, command, "x and z")?)?;
    let z = number(arg(args, start + 1, command, "x and z")?)?;
    let heading = args.get(start + 2).map(|h| number(h)).transpose()?.unwrap_or(0.0);
    Ok(Pose::new(Vec3::new(x, 0.0, z), heading))
}
