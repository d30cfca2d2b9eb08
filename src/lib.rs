//! A connection server, binary framing protocol and parameter registry for
//! exposing a long-running application over the network: a peer connects,
//! says hello, reads the application's metadata and parameters, merges
//! updates into them, and tells the application to run or pause.
pub mod app;
pub mod buffer;
pub mod clock;
pub mod connection;
pub mod frame;
pub mod param;
pub mod server;
pub mod table;
pub mod value;

pub use app::{AppState, Application, Handler};
pub use frame::Frame;
pub use param::{Constraints, MergeError, ParamRegistry};
pub use server::{Server, ServerConfig, ServerError};
pub use table::{Column, ColumnMeta, Table, TableError};
pub use value::{DecodeError, Duration, Timestamp, TypeTag, Value};
