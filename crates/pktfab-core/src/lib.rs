//! pktfab-core — multi-core packet capture and in-process processing fabric.
//!
//! Frames enter per-CPU receive engines through driver shims or a protocol
//! hook, accumulate into small batches, and are demultiplexed through a
//! device map into groups. Each group applies an optional filter and
//! functional program per frame and fans the result out to member sockets
//! over bounded queues, with optional kernel and device re-injection.

pub mod devmap;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fabric;
pub mod frame;
pub mod gc;
pub mod group;
pub mod hooks;
pub mod params;
pub mod pool;
pub mod socket;
pub mod stats;
pub mod time;

pub use devmap::{DeviceMap, ANY};
pub use engine::{fold, RxEngine};
pub use error::{FabricError, Result};
pub use exec::{
    Fanout, FanoutKind, FrameFilter, GroupProgram, InstalledProgram, Monad, ProgramEnv, CLASS_ANY,
    CLASS_DEFAULT, MAX_CLASSES,
};
pub use fabric::{DeviceXmit, Fabric, FabricSnapshot, KernelPath, NullDeviceXmit, NullKernelPath};
pub use frame::{Frame, PktType};
pub use gc::{BuffIdx, GcBatch, BATCH_CAP};
pub use group::{GroupTable, Policy, MAX_GROUPS};
pub use hooks::HookVerdict;
pub use params::FabricParams;
pub use socket::{Delivery, DeliveryHeader, Egress, Socket, SocketTable, MAX_SOCKETS};
pub use stats::GlobalStatsSnapshot;
