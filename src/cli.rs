use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::cert::csr::CsrConfig;

/// Mutating admission webhook filling AWS placeholders into crossplane IAM resources and IRSA service accounts
#[derive(Parser, Debug, Clone)]
#[command(name = "crossplane-irsa-webhook", disable_version_flag = true)]
pub struct Args {
    /// Port to listen on
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 443)]
    pub port: u16,

    /// Port to listen on for metrics and healthz (http)
    #[arg(long, env = "WEBHOOK_METRICS_PORT", default_value_t = 9999)]
    pub metrics_port: u16,

    /// (out-of-cluster) Absolute path to the API server kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// (out-of-cluster) The url to the API server
    #[arg(long, env = "WEBHOOK_KUBE_API")]
    pub kube_api: Option<String>,

    /// (out-of-cluster) TLS key file path
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/etc/webhook/certs/tls.key")]
    pub tls_key: PathBuf,

    /// (out-of-cluster) TLS certificate file path
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/etc/webhook/certs/tls.crt")]
    pub tls_cert: PathBuf,

    /// Use in-cluster authentication and the certificate signing request API
    #[arg(
        long,
        env = "WEBHOOK_IN_CLUSTER",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub in_cluster: bool,

    /// (in-cluster) The service name fronting this webhook
    #[arg(long, env = "WEBHOOK_SERVICE_NAME", default_value = "crossplane-irsa-webhook")]
    pub service_name: String,

    /// (in-cluster) The namespace this webhook and its TLS secret reside in
    #[arg(long, env = "WEBHOOK_NAMESPACE", default_value = "crossplane-system")]
    pub namespace: String,

    /// (in-cluster) The secret name for storing the TLS serving cert
    #[arg(long, env = "WEBHOOK_TLS_SECRET", default_value = "crossplane-irsa-webhook")]
    pub tls_secret: String,

    /// (in-cluster) Signer asked to issue the serving certificate
    #[arg(long, env = "WEBHOOK_SIGNER_NAME", default_value = "beta.eks.amazonaws.com/app-serving")]
    pub signer_name: String,

    /// The AWS region to configure for the AWS API calls
    #[arg(long, env = "AWS_REGION", default_value = "eu-west-1")]
    pub aws_region: String,

    /// Name of the Amazon EKS cluster to introspect for the OIDC provider
    #[arg(long, env = "CLUSTER_NAME", required_unless_present = "version")]
    pub cluster_name: Option<String>,

    /// Display the version and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub version: bool,
}

/// Where the serving certificate comes from
#[derive(Debug, Clone)]
pub enum CertStrategy {
    Files { cert: PathBuf, key: PathBuf },
    InCluster(CsrConfig),
}

impl Args {
    pub fn cert_strategy(&self) -> CertStrategy {
        if self.in_cluster {
            CertStrategy::InCluster(CsrConfig {
                service_name: self.service_name.clone(),
                namespace: self.namespace.clone(),
                secret_name: self.tls_secret.clone(),
                signer_name: self.signer_name.clone(),
            })
        } else {
            CertStrategy::Files {
                cert: self.tls_cert.clone(),
                key: self.tls_key.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_the_csr_strategy() {
        let args = Args::try_parse_from(["webhook", "--cluster-name", "blue"]).unwrap();
        assert_eq!(args.port, 443);
        assert_eq!(args.metrics_port, 9999);
        assert_eq!(args.cluster_name.as_deref(), Some("blue"));

        match args.cert_strategy() {
            CertStrategy::InCluster(config) => {
                assert_eq!(config.service_name, "crossplane-irsa-webhook");
                assert_eq!(config.namespace, "crossplane-system");
                assert_eq!(config.secret_name, "crossplane-irsa-webhook");
                assert_eq!(config.signer_name, "beta.eks.amazonaws.com/app-serving");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_cluster_uses_files() {
        let args = Args::try_parse_from([
            "webhook",
            "--cluster-name",
            "blue",
            "--in-cluster",
            "false",
            "--tls-cert",
            "/tmp/cert.pem",
        ])
        .unwrap();
        match args.cert_strategy() {
            CertStrategy::Files { cert, key } => {
                assert_eq!(cert, PathBuf::from("/tmp/cert.pem"));
                assert_eq!(key, PathBuf::from("/etc/webhook/certs/tls.key"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_in_cluster_flag_turns_it_on() {
        let args = Args::try_parse_from(["webhook", "--in-cluster", "--cluster-name", "blue"]).unwrap();
        assert!(args.in_cluster);
        assert!(matches!(args.cert_strategy(), CertStrategy::InCluster(_)));

        let args = Args::try_parse_from(["webhook", "--cluster-name", "blue", "--in-cluster=false"]).unwrap();
        assert!(!args.in_cluster);
    }

    #[test]
    fn cluster_name_is_required_unless_printing_version() {
        assert!(Args::try_parse_from(["webhook"]).is_err());
        let args = Args::try_parse_from(["webhook", "--version"]).unwrap();
        assert!(args.version);
    }
}
