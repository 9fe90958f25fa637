//! Admission review envelope (`admission.k8s.io/v1`).
//!
//! Inbound reviews are decoded with `kube::core::admission`, keeping the object
//! under review dynamic so each mutator can decode it into its own kind. The
//! outbound response is written with the types below, which leave `status`
//! out of a successful answer.

use k8s_openapi::ByteString;
use kube::core::admission;
use kube::core::{DynamicObject, GroupVersionResource};
use serde::{Deserialize, Serialize};

pub const META_KIND: &str = "AdmissionReview";
pub const META_API_VERSION_V1: &str = "admission.k8s.io/v1";

pub type Review = admission::AdmissionReview<DynamicObject>;

/// `group/version/resource`, or `version/resource` for the core group
pub fn resource_path(gvr: &GroupVersionResource) -> String {
    if gvr.group.is_empty() {
        format!("{}/{}", gvr.version, gvr.resource)
    } else {
        format!("{}/{}/{}", gvr.group, gvr.version, gvr.resource)
    }
}

/// Outbound envelope carrying a response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub kind: String,
    pub api_version: String,
    pub response: AdmissionResponse,
}

impl ReviewResponse {
    pub fn with_response(response: AdmissionResponse) -> Self {
        ReviewResponse {
            kind: META_KIND.to_owned(),
            api_version: META_API_VERSION_V1.to_owned(),
            response,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

/// metav1 `StatusReason` values used by this webhook
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    BadRequest,
    NotFound,
    Invalid,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub allowed: bool,
    /// Base64 on the wire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<PatchType>,
    #[serde(default, rename = "status", skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
}

impl AdmissionResponse {
    /// Allowed, no patch
    pub fn allowed() -> Self {
        AdmissionResponse {
            allowed: true,
            ..Default::default()
        }
    }

    /// Allowed with a serialized JSON patch
    pub fn patched(patch: Vec<u8>) -> Self {
        AdmissionResponse {
            allowed: true,
            patch: Some(ByteString(patch)),
            patch_type: Some(PatchType::JsonPatch),
            ..Default::default()
        }
    }

    /// Not allowed, with a status message for the administrator
    pub fn failed(reason: StatusReason, message: impl ToString) -> Self {
        AdmissionResponse {
            result: Some(Status {
                message: message.to_string(),
                reason: Some(reason),
            }),
            ..Default::default()
        }
    }

    /// Fixed response for a missing review or a review without a request
    pub fn bad_content() -> Self {
        Self::failed(StatusReason::BadRequest, "bad content")
    }

    pub fn message(&self) -> Option<&str> {
        self.result.as_ref().map(|s| s.message.as_str())
    }
}
