use crate::events::{AuditEvent, AuditSink};
use anyhow::Result;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::admission::Operation;
use kube::core::DynamicObject;
use signet_policy_controller_core::{
    evaluate, AdmissionAttributes, EngineConfig, ResourceContext, SignatureEvaluator, SignerPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct Admission {
    config: Arc<EngineConfig>,
    policy: Arc<SignerPolicy>,
    evaluator: Arc<dyn SignatureEvaluator>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        config: Arc<EngineConfig>,
        policy: Arc<SignerPolicy>,
        evaluator: Arc<dyn SignatureEvaluator>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            config,
            policy,
            evaluator,
            audit,
            timeout,
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let attrs = attributes(&req);

        // Deletions carry the object being removed in `old_object`.
        let Some(object) = req.object.as_ref().or(req.old_object.as_ref()) else {
            return AdmissionResponse::invalid("admission request missing 'object'");
        };
        let value = match serde_json::to_value(object) {
            Ok(value) => value,
            Err(error) => return AdmissionResponse::invalid(error),
        };
        let resource = ResourceContext::from_value(&value);

        let result = evaluate::decide_with_deadline(
            &resource,
            &attrs,
            &self.config,
            &self.policy,
            &*self.evaluator,
            None,
            self.timeout,
        )
        .await;

        self.audit
            .record(AuditEvent::from_decision(
                &result,
                &attrs.operation,
                &resource.kind,
                &resource.name,
            ))
            .await;

        if result.is_allowed() {
            return rsp;
        }
        info!(
            namespace = %resource.namespace,
            name = %resource.name,
            kind = %resource.kind,
            reason = %result.message,
            "Denied",
        );
        rsp.deny(result.message)
    }
}

fn attributes(req: &AdmissionRequest) -> AdmissionAttributes {
    let operation = match req.operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    };
    AdmissionAttributes {
        operation: operation.to_string(),
        user_name: req.user_info.username.clone().unwrap_or_default(),
        user_groups: req.user_info.groups.clone().unwrap_or_default(),
        dry_run: req.dry_run,
    }
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
