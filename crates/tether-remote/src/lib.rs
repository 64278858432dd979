//! Object remoting for Tether.
//!
//! An [`ObjectRemotingProxy`] sits on a communicator route and lets each side
//! hand the other objects and functions by reference. Plain data is copied
//! inline through [`DataInfoManager`]; references arrive as
//! [`RemoteObject`] / [`RemoteFunction`] stand-ins that forward every use to
//! their owner and release the owner's entry when dropped.

pub mod data_info_manager;
pub mod message;
pub mod object;
pub mod proxy;
pub mod stub;
pub mod value;

pub use data_info_manager::{DataInfoManager, LocalRef};
pub use message::ProxyMessage;
pub use object::DynamicObject;
pub use proxy::{ObjectRemotingProxy, ProxyOptions, Resolver};
pub use stub::{RemoteFunction, RemoteObject};
pub use value::{Callable, FnCallable, FunctionRef, ObjectRef, Remotable, Value};
