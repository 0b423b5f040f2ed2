use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::post,
    Router,
    Json,
};
use std::sync::Arc;
use kube::core::{admission::{AdmissionRequest, AdmissionResponse, AdmissionReview}, DynamicObject};

use relay_operator_common::telemetry::info;
use relay_operator_controller::controller::context::Context;

use crate::admission::mirror::validate_mirrored_object;

pub fn router() -> Router {
    Router::new().route("/mirror/validate", post(validate_mirror_endpoint))
}

async fn validate_mirror_endpoint(Extension(ctx): Extension<Arc<Context>>, payload: Json<AdmissionReview<DynamicObject>>) -> impl IntoResponse {
    let request: AdmissionRequest<DynamicObject> = match payload.0.try_into() {
        Ok(request) => request,
        Err(err) => {
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };
    // Defaults to allow
    let mut response = AdmissionResponse::from(&request);

    if let Err(err) = validate_mirrored_object(&request, &ctx).await {
        info!(
            event = "Denied",
            kind = request.kind.kind.as_str(),
            name = request.name.as_str(),
            namespace = request.namespace.as_deref().unwrap_or_default(),
            reason = %err,
        );
        response = response.deny(err.to_string());
    }

    Json(response.into_review())
}
