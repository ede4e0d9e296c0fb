//! HTTP caching proxy (spec §4.8–§4.9, components C8–C9): safe path
//! algebra, the process-wide cache lock service, and the proxy
//! resource itself.

pub mod cache;
pub mod httpdate;
pub mod path;
pub mod proxy;
