//! Obtain the serving certificate from the cluster's certificates.k8s.io/v1 API.
//!
//! The issued pair is kept in a `kubernetes.io/tls` secret so a restarted pod
//! reuses it instead of filing a new request. A fresh request is filed once the
//! current certificate reaches its rotation threshold.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::{Api, Client};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use tracing::*;

use super::{CertBundle, CertStore};
use crate::shutdown::ShutdownSignal;
use crate::{Error, Result};

/// How long an approver gets to act on a submitted request
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Delay before a failed request is filed again
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

const FIELD_MANAGER: &str = "crossplane-irsa-webhook";
const SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_CERT: &str = "tls.crt";
const TLS_KEY: &str = "tls.key";
const USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];

#[derive(Clone, Debug)]
pub struct CsrConfig {
    pub service_name: String,
    pub namespace: String,
    pub secret_name: String,
    pub signer_name: String,
}

/// Subject of the serving certificate for a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServingIdentity {
    pub common_name: String,
    pub dns_names: Vec<String>,
}

impl ServingIdentity {
    pub fn new(service: &str, namespace: &str) -> Self {
        ServingIdentity {
            common_name: format!("{service}.{namespace}.svc"),
            dns_names: vec![
                service.to_owned(),
                format!("{service}.{namespace}"),
                format!("{service}.{namespace}.svc"),
                format!("{service}.{namespace}.svc.cluster.local"),
            ],
        }
    }

    /// PEM encoded PKCS#10 request signed by `key_pair`
    pub fn csr_pem(&self, key_pair: &KeyPair) -> Result<String> {
        let mut params = CertificateParams::new(self.dns_names.clone()).map_err(tls)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(self.common_name.clone()));
        params.distinguished_name = dn;
        params
            .serialize_request(key_pair)
            .and_then(|csr| csr.pem())
            .map_err(tls)
    }
}

fn tls(err: rcgen::Error) -> Error {
    Error::Tls(err.to_string())
}

pub struct CsrManager {
    csrs: Api<CertificateSigningRequest>,
    secrets: Api<Secret>,
    config: CsrConfig,
    store: Arc<CertStore>,
}

impl CsrManager {
    pub fn new(client: Client, config: CsrConfig, store: Arc<CertStore>) -> Self {
        CsrManager {
            csrs: Api::all(client.clone()),
            secrets: Api::namespaced(client, &config.namespace),
            config,
            store,
        }
    }

    /// Keep the store populated with a valid certificate until shutdown
    pub async fn run(self, shutdown: ShutdownSignal) {
        let stop = shutdown.recv();
        tokio::pin!(stop);

        if let Err(err) = self.load_existing().await {
            warn!(secret = %self.config.secret_name, error = %err, "could not reuse stored certificate");
        }

        loop {
            if self.store.needs_rotation() {
                let rotated = tokio::select! {
                    _ = &mut stop => None,
                    res = self.rotate() => Some(res),
                };
                match rotated {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!(error = %err, retry = ?RETRY_INTERVAL, "could not obtain serving certificate")
                    }
                }
            }

            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(self.next_check()) => {}
            }
        }
        debug!("stopping certificate manager");
    }

    fn next_check(&self) -> Duration {
        self.store
            .current()
            .map(|bundle| bundle.until_rotation())
            .unwrap_or(RETRY_INTERVAL)
            .max(RETRY_INTERVAL)
    }

    /// Serve the certificate kept in the TLS secret when it is still fresh
    async fn load_existing(&self) -> Result<()> {
        let Some(secret) = self.secrets.get_opt(&self.config.secret_name).await? else {
            info!(secret = %self.config.secret_name, "no stored certificate");
            return Ok(());
        };
        let data = secret.data.unwrap_or_default();
        let (Some(cert), Some(key)) = (data.get(TLS_CERT), data.get(TLS_KEY)) else {
            info!(secret = %self.config.secret_name, "stored certificate is incomplete");
            return Ok(());
        };

        let bundle = CertBundle::from_pem(&cert.0, &key.0)?;
        if bundle.needs_rotation() {
            info!(secret = %self.config.secret_name, "stored certificate is due for rotation");
            return Ok(());
        }
        self.store.replace(bundle);
        Ok(())
    }

    /// File a new request, wait for issuance, persist and serve the result
    async fn rotate(&self) -> Result<()> {
        let identity = ServingIdentity::new(&self.config.service_name, &self.config.namespace);
        let key_pair = KeyPair::generate().map_err(tls)?;
        let request = identity.csr_pem(&key_pair)?;

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", self.config.service_name)),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.into_bytes()),
                signer_name: self.config.signer_name.clone(),
                usages: Some(USAGES.iter().map(|u| u.to_string()).collect()),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        let created = self.csrs.create(&PostParams::default(), &csr).await?;
        let name = created.metadata.name.unwrap_or_default();
        info!(csr = %name, common_name = %identity.common_name, signer = %self.config.signer_name, "submitted certificate signing request");

        let settled = tokio::time::timeout(
            APPROVAL_TIMEOUT,
            await_condition(self.csrs.clone(), &name, is_settled),
        )
        .await
        .map_err(|_| Error::CsrRejected {
            name: name.clone(),
            reason: format!("not issued within {APPROVAL_TIMEOUT:?}"),
        })??
        .ok_or_else(|| Error::CsrRejected {
            name: name.clone(),
            reason: "deleted while waiting for approval".to_owned(),
        })?;

        let cert_pem = issued_certificate(&name, &settled)?;
        let key_pem = key_pair.serialize_pem().into_bytes();
        install(&self.store, cert_pem, key_pem, |cert, key| self.persist(cert, key)).await
    }

    async fn persist(&self, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.config.secret_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..ObjectMeta::default()
            },
            type_: Some(SECRET_TYPE.to_owned()),
            data: Some(BTreeMap::from([
                (TLS_CERT.to_owned(), ByteString(cert_pem)),
                (TLS_KEY.to_owned(), ByteString(key_pem)),
            ])),
            ..Secret::default()
        };
        self.secrets
            .patch(
                &self.config.secret_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        info!(secret = %self.config.secret_name, "stored serving certificate");
        Ok(())
    }
}

/// Serve an issued pair, then hand it to `persist`.
///
/// A failed write only costs the reuse after a restart, so it is logged and
/// the certificate keeps serving.
async fn install<P, F>(store: &CertStore, cert_pem: Vec<u8>, key_pem: Vec<u8>, persist: P) -> Result<()>
where
    P: FnOnce(Vec<u8>, Vec<u8>) -> F,
    F: Future<Output = Result<()>>,
{
    store.replace(CertBundle::from_pem(&cert_pem, &key_pem)?);
    if let Err(err) = persist(cert_pem, key_pem).await {
        warn!(error = %err, "could not store serving certificate, it will be requested again after a restart");
    }
    Ok(())
}

fn is_rejection(condition: &CertificateSigningRequestCondition) -> bool {
    matches!(condition.type_.as_str(), "Denied" | "Failed") && condition.status == "True"
}

/// Issued, denied or failed: nothing more will happen to this request
fn is_settled(csr: Option<&CertificateSigningRequest>) -> bool {
    let Some(status) = csr.and_then(|c| c.status.as_ref()) else {
        return false;
    };
    status.certificate.as_ref().map_or(false, |c| !c.0.is_empty())
        || status.conditions.iter().flatten().any(is_rejection)
}

fn issued_certificate(name: &str, csr: &CertificateSigningRequest) -> Result<Vec<u8>> {
    let status = csr.status.as_ref();
    if let Some(rejected) = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| is_rejection(c)))
    {
        return Err(Error::CsrRejected {
            name: name.to_owned(),
            reason: rejected
                .message
                .clone()
                .or_else(|| rejected.reason.clone())
                .unwrap_or_else(|| rejected.type_.clone()),
        });
    }

    status
        .and_then(|s| s.certificate.as_ref())
        .filter(|c| !c.0.is_empty())
        .map(|c| c.0.clone())
        .ok_or_else(|| Error::CsrRejected {
            name: name.to_owned(),
            reason: "no certificate in status".to_owned(),
        })
}
