mod observer;
pub mod policy;

pub use observer::{
    ConnectionType,
    NetworkEvent,
    NetworkObserver,
    NetworkProbe,
    NetworkStatus,
};
pub use policy::Admission;
