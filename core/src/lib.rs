pub mod bsize;
pub mod ccw;
pub mod css;
pub mod cu;
pub mod dmachan;
pub mod hldev;
pub mod mem;
pub mod proto;
pub mod scsw;
pub mod status;
pub mod trc;
pub mod txsm;
pub mod types;
