//! Generation tasks fulfilled by an external vendor.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use taskforge_ai::{
    CallContext, VendorError, VendorJobClient, VendorJobKind, VendorJobState, VendorRegistry,
    VendorRequest, VendorSubmission,
};
use taskforge_core::{ImageDownloadPayload, TaskError, TaskMeta, TaskPayload, TaskResult};

use super::{Completion, HandlerOutcome, PollOutcome, TaskHandler, VendorJobRef};

/// Which vendor serves a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorRoute {
    /// Always the named vendor.
    Fixed(String),
    /// The vendor named in the payload itself.
    FromPayload,
}

fn vendor_error(err: VendorError) -> TaskError {
    match err {
        VendorError::Rejected(msg) => TaskError::vendor_failed(msg),
        other => TaskError::vendor_unavailable(other.to_string()),
    }
}

/// Map a payload onto the provider-neutral request.
pub fn vendor_request(payload: &TaskPayload) -> TaskResult<VendorRequest> {
    let request = match payload {
        TaskPayload::ImageCompletion(p) => {
            let kind = if p.image.is_some() {
                VendorJobKind::ImageToImage
            } else {
                VendorJobKind::TextToImage
            };
            let mut r = VendorRequest::new(kind, &p.meta.model);
            r.prompt = p.prompt.clone();
            r.negative_prompt = p.negative_prompt.clone();
            r.image = p.image.clone();
            r.image_count = p.image_count.max(1);
            r.width = p.width;
            r.height = p.height;
            r.steps = p.steps;
            r.seed = p.seed;
            r.style_preset = p.style_preset.clone();
            r
        }
        TaskPayload::ArtisticText(p) => {
            let mut r = VendorRequest::new(VendorJobKind::ArtisticText, &p.meta.model);
            r.text = Some(p.text.clone());
            r.prompt = p.prompt.clone();
            r.negative_prompt = p.negative_prompt.clone();
            r.image_count = p.image_count.max(1);
            r
        }
        TaskPayload::ImageToVideo(p) => {
            let mut r = VendorRequest::new(VendorJobKind::ImageToVideo, &p.meta.model);
            r.image = Some(p.image.clone());
            r.prompt = p.prompt.clone();
            r.seed = p.seed;
            r
        }
        TaskPayload::ImageUpscale(p) => {
            let mut r = VendorRequest::new(VendorJobKind::Upscale, &p.meta.model);
            r.image = Some(p.image.clone());
            r.scale = Some(p.scale);
            r
        }
        TaskPayload::ImageColorization(p) => {
            let mut r = VendorRequest::new(VendorJobKind::Colorize, &p.meta.model);
            r.image = Some(p.image.clone());
            r
        }
        TaskPayload::GroupChat(_) | TaskPayload::ImageDownload(_) => {
            return Err(TaskError::handler(format!(
                "{} is not a vendor generation task",
                payload.task_type()
            )));
        }
    };
    Ok(request)
}

/// Submits generation requests and polls accepted vendor jobs.
pub struct VendorTaskHandler {
    vendors: VendorRegistry,
    route: VendorRoute,
    persist_assets: bool,
}

impl VendorTaskHandler {
    pub fn new(vendors: VendorRegistry, route: VendorRoute) -> Self {
        Self {
            vendors,
            route,
            persist_assets: true,
        }
    }

    /// Chain an asset download after success (on by default).
    pub fn with_asset_persistence(mut self, enabled: bool) -> Self {
        self.persist_assets = enabled;
        self
    }

    fn client(&self, name: &str) -> TaskResult<Arc<dyn VendorJobClient>> {
        self.vendors
            .get(name)
            .ok_or_else(|| TaskError::UnknownVendor(name.to_string()))
    }

    fn resolve(&self, payload: &TaskPayload) -> TaskResult<(String, Arc<dyn VendorJobClient>)> {
        let name = match &self.route {
            VendorRoute::Fixed(name) => name.clone(),
            VendorRoute::FromPayload => payload
                .vendor()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| TaskError::UnknownVendor(String::new()))?
                .to_string(),
        };
        let client = self.client(&name)?;
        Ok((name, client))
    }
}

fn with_origin(completion: Completion, payload: &TaskPayload) -> Completion {
    match payload.image() {
        Some(origin) => completion.with_origin_image(origin),
        None => completion,
    }
}

impl TaskHandler for VendorTaskHandler {
    fn handle(&self, ctx: &CallContext, payload: &TaskPayload) -> TaskResult<HandlerOutcome> {
        let (vendor, client) = self.resolve(payload)?;
        let request = vendor_request(payload)?;

        match client.submit(ctx, &request).map_err(vendor_error)? {
            VendorSubmission::Completed { resources } => {
                let completion = Completion::assets(resources).with_vendor(vendor);
                Ok(HandlerOutcome::Completed(with_origin(completion, payload)))
            }
            VendorSubmission::Accepted { job_id } => {
                debug!(task_id = %ctx.task_id(), vendor = %vendor, job_id = %job_id, "vendor accepted job");
                Ok(HandlerOutcome::Accepted(VendorJobRef { vendor, job_id }))
            }
        }
    }

    fn poll(
        &self,
        ctx: &CallContext,
        payload: &TaskPayload,
        job: &VendorJobRef,
    ) -> TaskResult<PollOutcome> {
        let client = self.client(&job.vendor)?;
        let status = client
            .query_status(ctx, &job.job_id)
            .map_err(|e| TaskError::vendor_unavailable(e.to_string()))?;

        if status.state.is_in_progress() {
            return Ok(PollOutcome::InProgress);
        }
        match status.state {
            VendorJobState::Failed => Ok(PollOutcome::Failed(
                status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} job failed", job.vendor)),
            )),
            _ => {
                let mut completion =
                    Completion::assets(status.usable_resources()).with_vendor(job.vendor.clone());
                let (width, height) = payload.dimensions();
                completion.width = width;
                completion.height = height;
                Ok(PollOutcome::Completed(with_origin(completion, payload)))
            }
        }
    }

    fn follow_up(&self, payload: &TaskPayload, completion: &Completion) -> Option<TaskPayload> {
        if !self.persist_assets || completion.resources.is_empty() {
            return None;
        }
        let source_task_id = payload.id()?.clone();
        Some(TaskPayload::ImageDownload(ImageDownloadPayload {
            meta: TaskMeta {
                id: None,
                uid: payload.uid(),
                quota: 0,
                frozen_quota: 0,
                model: String::new(),
                created_at: Utc::now(),
            },
            source_task_id,
            resources: completion.resources.clone(),
        }))
    }
}
