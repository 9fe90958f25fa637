use json_patch::{Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionResource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::*;

use crate::crossplane::{self, Policy, Role};
use crate::placeholder::Modifier;
use crate::review::{self, AdmissionResponse, Review, StatusReason};
use crate::{Error, Result};

/// Annotation read by the EKS pod identity webhook
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

pub const UNROUTABLE_MESSAGE: &str =
    "Could not identify request resource as any registered target types.";

/// Resource kinds this webhook knows how to rewrite
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mutator {
    /// crossplane IAM `Role`, trust policy document
    Role,
    /// crossplane IAM `Policy`, policy document
    Policy,
    /// core `ServiceAccount`, role ARN annotation
    ServiceAccount,
}

impl Mutator {
    pub const ALL: [Mutator; 3] = [Mutator::Role, Mutator::Policy, Mutator::ServiceAccount];

    /// Select the mutator registered for an exact (group, version, resource) triple
    pub fn for_resource(resource: &GroupVersionResource) -> Option<Self> {
        match (
            resource.group.as_str(),
            resource.version.as_str(),
            resource.resource.as_str(),
        ) {
            (crossplane::GROUP, crossplane::VERSION, "roles") => Some(Mutator::Role),
            (crossplane::GROUP, crossplane::VERSION, "policies") => Some(Mutator::Policy),
            ("", "v1", "serviceaccounts") => Some(Mutator::ServiceAccount),
            _ => None,
        }
    }

    pub fn resource(self) -> GroupVersionResource {
        match self {
            Mutator::Role => GroupVersionResource::gvr(crossplane::GROUP, crossplane::VERSION, "roles"),
            Mutator::Policy => {
                GroupVersionResource::gvr(crossplane::GROUP, crossplane::VERSION, "policies")
            }
            Mutator::ServiceAccount => GroupVersionResource::gvr("", "v1", "serviceaccounts"),
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Mutator::Role => "Role",
            Mutator::Policy => "Policy",
            Mutator::ServiceAccount => "ServiceAccount",
        }
    }

    /// Decode `object`, find the one substitutable field and build its replace operation.
    ///
    /// `Ok(None)` means the field is absent or holds no placeholder.
    pub fn locate_and_substitute(
        self,
        object: Option<&DynamicObject>,
        modifier: &Modifier,
    ) -> Result<Option<PatchOperation>> {
        let (meta, located) = match self {
            Mutator::Role => {
                let role: Role = decode(self, object)?;
                let doc = role.spec.for_provider.assume_role_policy_document;
                (role.metadata, Some(("/spec/forProvider/assumeRolePolicyDocument".to_owned(), doc)))
            }
            Mutator::Policy => {
                let policy: Policy = decode(self, object)?;
                let doc = policy.spec.for_provider.document;
                (policy.metadata, Some(("/spec/forProvider/document".to_owned(), doc)))
            }
            Mutator::ServiceAccount => {
                let mut sa: ServiceAccount = decode(self, object)?;
                let arn = sa
                    .metadata
                    .annotations
                    .as_mut()
                    .and_then(|a| a.remove(ROLE_ARN_ANNOTATION));
                let path = format!("/metadata/annotations/{}", escape_pointer(ROLE_ARN_ANNOTATION));
                (sa.metadata, arn.map(|arn| (path, arn)))
            }
        };

        let Some((path, doc)) = located else {
            debug!(kind = self.kind(), object = %describe(&meta), "not mutated, no annotation");
            return Ok(None);
        };

        let (updated, changed) = modifier.replace_placeholders(&doc);
        if !changed {
            debug!(
                kind = self.kind(),
                object = %describe(&meta),
                "not mutated, replacement placeholders not found"
            );
            return Ok(None);
        }

        debug!(kind = self.kind(), object = %describe(&meta), "mutated");
        Ok(Some(PatchOperation::Replace(ReplaceOperation {
            path,
            value: Value::String(updated),
        })))
    }

    /// Build the admission response for a review of this mutator's resource kind
    pub fn mutate(self, review: Option<&Review>, modifier: &Modifier) -> AdmissionResponse {
        let Some(req) = review.and_then(|r| r.request.as_ref()) else {
            return AdmissionResponse::bad_content();
        };

        let object = req.object.as_ref();
        let op = match self.locate_and_substitute(object, modifier) {
            Ok(Some(op)) => op,
            Ok(None) => return AdmissionResponse::allowed(),
            Err(err) => {
                error!(kind = self.kind(), error = %err, "could not decode raw object");
                trace!(object = ?object, "undecodable object");
                return AdmissionResponse::failed(StatusReason::Invalid, err);
            }
        };

        match serde_json::to_vec(&Patch(vec![op])) {
            Ok(patch) => AdmissionResponse::patched(patch),
            Err(err) => {
                let err = Error::Serialization(err);
                error!(kind = self.kind(), error = %err, "error marshaling patch");
                AdmissionResponse::failed(StatusReason::Invalid, err)
            }
        }
    }
}

/// Dispatch a review to the mutator registered for its resource
pub fn route(review: Option<&Review>, modifier: &Modifier) -> (Option<Mutator>, AdmissionResponse) {
    let Some(req) = review.and_then(|r| r.request.as_ref()) else {
        return (None, AdmissionResponse::bad_content());
    };
    match Mutator::for_resource(&req.resource) {
        Some(mutator) => (Some(mutator), mutator.mutate(review, modifier)),
        None => {
            debug!(resource = %review::resource_path(&req.resource), "no mutator registered");
            (None, AdmissionResponse::failed(StatusReason::NotFound, UNROUTABLE_MESSAGE))
        }
    }
}

/// Decode the dynamic object under review into the typed shape of `mutator`'s kind
fn decode<T: DeserializeOwned>(mutator: Mutator, object: Option<&DynamicObject>) -> Result<T> {
    let value = serde_json::to_value(object).map_err(Error::Serialization)?;
    serde_json::from_value(value).map_err(|source| Error::Decode {
        kind: mutator.kind(),
        source,
    })
}

/// Escape a single JSON pointer reference token (RFC 6901)
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn describe(meta: &ObjectMeta) -> String {
    let name = meta
        .name
        .as_deref()
        .or(meta.generate_name.as_deref())
        .unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::PatchType;
    use serde_json::json;

    const ACCOUNT_ID: &str = "123456789012";
    const CLUSTER_OIDC: &str = "oidc.eks.eu-west-1.amazonaws.com/id/6A0A07D566C756AECD797B338FAA4A4D";
    const REQUEST_UID: &str = "918ef1dc-928f-4525-99ef-988389f263c3";

    const TRUST_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Federated":"arn:aws:iam::${ACCOUNT_ID}:oidc-provider/${OIDC_PROVIDER}"},"Action":"sts:AssumeRoleWithWebIdentity","Condition":{"StringEquals":{"${OIDC_PROVIDER}:aud":"sts.amazonaws.com","${OIDC_PROVIDER}:sub":"system:serviceaccount:my-namespace:my-service-account"}}}]}"#;

    fn modifier() -> Modifier {
        Modifier::builder()
            .account_id(ACCOUNT_ID)
            .region("eu-west-1")
            .cluster_name("blue")
            .oidc_provider(CLUSTER_OIDC)
            .build()
            .unwrap()
    }

    fn review(mutator: Mutator, object: Value) -> Review {
        let gvr = mutator.resource();
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": REQUEST_UID,
                "kind": {"group": gvr.group, "version": gvr.version, "kind": mutator.kind()},
                "resource": {"group": gvr.group, "version": gvr.version, "resource": gvr.resource},
                "operation": "CREATE",
                "userInfo": {"username": "kubernetes-admin"},
                "object": object
            }
        }))
        .unwrap()
    }

    fn role(doc: &str) -> Value {
        json!({
            "apiVersion": "iam.aws.crossplane.io/v1beta1",
            "kind": "Role",
            "metadata": {"name": "sample-irsa-role", "labels": {"type": "sample-irsa-role"}},
            "spec": {
                "forProvider": {"assumeRolePolicyDocument": doc},
                "providerConfigRef": {"name": "default"}
            }
        })
    }

    fn service_account(annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "my-service-account", "namespace": "my-namespace", "annotations": annotations}
        })
    }

    fn patch_of(res: &AdmissionResponse) -> Value {
        serde_json::from_slice(&res.patch.as_ref().unwrap().0).unwrap()
    }

    #[test]
    fn missing_review_or_request_is_bad_content() {
        for mutator in Mutator::ALL {
            let m = modifier();
            assert_eq!(mutator.mutate(None, &m), AdmissionResponse::bad_content());
            let empty: Review = serde_json::from_value(json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview"
            }))
            .unwrap();
            assert_eq!(mutator.mutate(Some(&empty), &m), AdmissionResponse::bad_content());
        }
    }

    #[test]
    fn role_trust_policy_is_rewritten_in_one_operation() {
        let res = Mutator::Role.mutate(Some(&review(Mutator::Role, role(TRUST_POLICY))), &modifier());
        assert!(res.allowed);
        assert_eq!(res.patch_type, Some(PatchType::JsonPatch));

        let expected = TRUST_POLICY
            .replace("${ACCOUNT_ID}", ACCOUNT_ID)
            .replace("${OIDC_PROVIDER}", CLUSTER_OIDC);
        assert_eq!(
            patch_of(&res),
            json!([{
                "op": "replace",
                "path": "/spec/forProvider/assumeRolePolicyDocument",
                "value": expected
            }])
        );
    }

    #[test]
    fn role_without_placeholders_is_allowed_unchanged() {
        let doc = TRUST_POLICY
            .replace("${ACCOUNT_ID}", "210987654321")
            .replace("${OIDC_PROVIDER}", "oidc.eks.eu-west-1.amazonaws.com/id/BA1A07D566C756AECD797B338FAA4C4F");
        let res = Mutator::Role.mutate(Some(&review(Mutator::Role, role(&doc))), &modifier());
        assert_eq!(res, AdmissionResponse::allowed());
    }

    #[test]
    fn policy_document_is_rewritten() {
        let object = json!({
            "apiVersion": "iam.aws.crossplane.io/v1beta1",
            "kind": "Policy",
            "metadata": {"name": "s3-read"},
            "spec": {"forProvider": {
                "name": "s3-read",
                "document": "{\"Resource\":\"arn:aws:s3:::$CLUSTER_NAME-$AWS_REGION/*\"}"
            }}
        });
        let res = Mutator::Policy.mutate(Some(&review(Mutator::Policy, object)), &modifier());
        assert_eq!(
            patch_of(&res),
            json!([{
                "op": "replace",
                "path": "/spec/forProvider/document",
                "value": "{\"Resource\":\"arn:aws:s3:::blue-eu-west-1/*\"}"
            }])
        );
    }

    #[test]
    fn service_account_patch_is_exact() {
        let object = service_account(json!({ROLE_ARN_ANNOTATION: "arn:aws:iam::${ACCOUNT_ID}:role/x"}));
        let res = Mutator::ServiceAccount
            .mutate(Some(&review(Mutator::ServiceAccount, object)), &modifier());
        assert_eq!(
            String::from_utf8(res.patch.unwrap().0).unwrap(),
            r#"[{"op":"replace","path":"/metadata/annotations/eks.amazonaws.com~1role-arn","value":"arn:aws:iam::123456789012:role/x"}]"#
        );
    }

    #[test]
    fn service_account_without_annotation_or_placeholder_is_untouched() {
        for annotations in [
            json!({"team": "platform"}),
            json!({ROLE_ARN_ANNOTATION: "arn:aws:iam::123456789012:role/x"}),
        ] {
            let object = service_account(annotations);
            let res = Mutator::ServiceAccount
                .mutate(Some(&review(Mutator::ServiceAccount, object)), &modifier());
            assert_eq!(res, AdmissionResponse::allowed());
        }
    }

    #[test]
    fn mistyped_object_reports_decode_error() {
        let object = json!({"metadata": {"name": "r"}, "spec": {"forProvider": {"assumeRolePolicyDocument": 42}}});
        let res = Mutator::Role.mutate(Some(&review(Mutator::Role, object)), &modifier());
        assert!(!res.allowed);
        assert!(res.patch.is_none());
        assert!(res.message().unwrap().starts_with("could not decode Role"));
        assert_eq!(res.result.unwrap().reason, Some(StatusReason::Invalid));
    }

    #[test]
    fn missing_object_is_a_decode_error() {
        let res = Mutator::ServiceAccount
            .mutate(Some(&review(Mutator::ServiceAccount, Value::Null)), &modifier());
        assert!(res.patch.is_none());
        assert!(res.message().unwrap().starts_with("could not decode ServiceAccount"));
    }

    #[test]
    fn routing_requires_an_exact_triple() {
        for mutator in Mutator::ALL {
            assert_eq!(Mutator::for_resource(&mutator.resource()), Some(mutator));
        }
        for (group, version, resource) in [
            ("x", "v1", "widgets"),
            ("iam.aws.crossplane.io", "v1alpha1", "roles"),
            ("iam.aws.crossplane.io", "v1beta1", "Roles"),
            ("", "v1", "pods"),
            ("core", "v1", "serviceaccounts"),
        ] {
            assert_eq!(
                Mutator::for_resource(&GroupVersionResource::gvr(group, version, resource)),
                None
            );
        }
    }

    #[test]
    fn unroutable_review_carries_fixed_message() {
        let mut r = review(Mutator::Role, role(TRUST_POLICY));
        r.request.as_mut().unwrap().resource = GroupVersionResource::gvr("x", "v1", "widgets");
        let (mutator, res) = route(Some(&r), &modifier());
        assert_eq!(mutator, None);
        assert_eq!(res.message(), Some(UNROUTABLE_MESSAGE));
        assert!(res.patch.is_none());
        assert!(!res.allowed);
    }

    #[test]
    fn pointer_tokens_are_escaped() {
        assert_eq!(escape_pointer(ROLE_ARN_ANNOTATION), "eks.amazonaws.com~1role-arn");
        assert_eq!(escape_pointer("a~b/c"), "a~0b~1c");
    }
}
