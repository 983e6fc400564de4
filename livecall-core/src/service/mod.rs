pub mod id_gen;
pub mod room_directory;
pub mod room_logic;
pub mod stat;

pub use id_gen::{RoomIdGenerator, SnowflakeIdGenerator};
pub use room_directory::{RoomDirectory, RoomEvents};
pub use room_logic::{Collaborators, RoomLogic};
pub use stat::{sink_from_config, StatCollector, StatRecord, StatSink};
