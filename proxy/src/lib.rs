pub mod errors;
pub mod rewrites;
pub mod router;
pub mod tenant_proxy;

pub use errors::ProxyError;
pub use rewrites::{CortexPushRewrite, PathRewrite, ReplacePathPrefix, RequestHead, ResponseRewrite};
pub use router::Router;
pub use tenant_proxy::{TenantProxy, UpstreamClient, upstream_client};
