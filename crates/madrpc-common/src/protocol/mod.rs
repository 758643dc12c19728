pub mod error;
pub mod requests;
pub mod responses;


pub use error::{MadrpcError, Result};
pub use requests::{generate_source_id, CallSession, Generator, LbContext, RpcArgs, SourceId};
pub use responses::{ProviderResult, RpcResult};
