use thiserror::Error;

/// Errors raised by the webhook library
#[derive(Error, Debug)]
pub enum Error {
    /// Start-up configuration is incomplete or inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The submitted object does not match the shape of its declared kind
    #[error("could not decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Error during JSON serialization
    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The cloud control plane returned something we could not use
    #[error("cluster introspection failed: {0}")]
    Introspection(String),

    /// Certificate or key material could not be parsed
    #[error("invalid TLS material: {0}")]
    Tls(String),

    /// No serving certificate has been loaded or issued yet
    #[error("no serving certificate available for the webhook, is the CSR approved?")]
    NoCertificate,

    /// The cluster refused or failed to issue a serving certificate
    #[error("certificate signing request {name} was not issued: {reason}")]
    CsrRejected { name: String, reason: String },

    /// Error from the Kubernetes client
    #[error("Kube Error: {0}")]
    Kube(#[from] kube::Error),

    /// Error while waiting on a Kubernetes object
    #[error("Wait Error: {0}")]
    Wait(#[from] kube::runtime::wait::Error),

    /// Error from the metrics registry
    #[error("Metrics Error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for webhook operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
