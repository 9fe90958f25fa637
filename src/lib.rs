//! Mutating admission webhook that fills AWS account, region, cluster and OIDC
//! provider placeholders into crossplane IAM `Role`/`Policy` documents and into
//! the IRSA role annotation of `ServiceAccount`s.

pub mod cert;
pub mod cli;
pub mod crossplane;
pub mod error;
pub mod handler;
pub mod introspect;
pub mod metrics;
pub mod mutate;
pub mod placeholder;
pub mod review;
pub mod server;
pub mod shutdown;
pub mod version;

pub use error::{Error, Result};
