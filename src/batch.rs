//! Batch fan-out.
//!
//! A batch shares one kind and one parameter set across N inputs. Inputs
//! are staged first; the batch and all of its children are then recorded
//! in one store write, so no reader ever sees a batch short of children.
//! Each child then takes the inline or queued path from its own size, and
//! inline children run concurrently.

use futures::future::join_all;
use serde::Serialize;

use mf_core::events::EventPayload;
use mf_core::{Batch, BatchId, BlobRef, Error, Job, JobId, JobKind, Priority, RawParams, Result};

use crate::context::Context;
use crate::submission::{admit, run_inline, stage, Input};
use crate::validation::{check_size, validate};

#[derive(Debug, Clone)]
pub struct BatchInput {
    pub input: Input,
    pub size_hint: u64,
}

impl BatchInput {
    /// For byte inputs the size hint is the byte length.
    pub fn new(input: impl Into<Input>) -> Self {
        let input = input.into();
        let size_hint = match &input {
            Input::Bytes(bytes) => bytes.len() as u64,
            Input::Blob(_) => 0,
        };
        Self { input, size_hint }
    }

    pub fn with_size_hint(mut self, size_hint: u64) -> Self {
        self.size_hint = size_hint;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub kind: JobKind,
    pub params: RawParams,
    pub inputs: Vec<BatchInput>,
    pub force_async: bool,
    pub priority: Priority,
}

impl BatchRequest {
    pub fn new(kind: JobKind, params: RawParams, inputs: Vec<BatchInput>) -> Self {
        Self {
            kind,
            params,
            inputs,
            force_async: false,
            priority: Priority::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// In input order.
    pub child_ids: Vec<JobId>,
}

pub async fn submit_batch(ctx: &Context, req: BatchRequest) -> Result<BatchHandle> {
    if req.inputs.is_empty() {
        return Err(Error::validation("inputs", "a batch needs at least one input"));
    }
    let params = validate(req.kind, &req.params, 0, &ctx.config)?;
    for (index, input) in req.inputs.iter().enumerate() {
        check_size(req.kind, input.size_hint, &ctx.config).map_err(|e| match e {
            Error::Validation { field, message } => {
                Error::validation(format!("inputs[{index}].{field}"), message)
            }
            other => other,
        })?;
    }

    let batch = Batch::new(req.kind, params.clone());

    // Stage every input before anything is recorded, so a failure leaves
    // neither a batch nor children behind.
    let mut children = Vec::with_capacity(req.inputs.len());
    let mut staged = Vec::new();
    for input in req.inputs {
        let (input_ref, fresh) = match stage(ctx, input.input).await {
            Ok(staged_input) => staged_input,
            Err(e) => {
                release(ctx, &staged).await;
                return Err(e);
            }
        };
        if fresh {
            staged.push(input_ref.clone());
        }
        children.push(
            Job::new(req.kind, params.clone(), input_ref, input.size_hint)
                .with_parent(batch.id)
                .with_priority(req.priority),
        );
    }

    if let Err(e) = ctx.store.create_batch(&batch, &children) {
        release(ctx, &staged).await;
        return Err(e);
    }
    ctx.emit(EventPayload::BatchCreated {
        batch_id: batch.id,
        children: children.len(),
    });
    tracing::info!(
        batch_id = %batch.id,
        kind = %req.kind,
        children = children.len(),
        "Batch created"
    );

    let child_ids: Vec<JobId> = children.iter().map(|job| job.id).collect();
    let mut inline = Vec::new();
    for job in &children {
        if admit(ctx, job, req.force_async) {
            inline.push(job.id);
        }
    }

    // Child failures are recorded on the children; only store errors are
    // worth a log line here.
    let results = join_all(inline.iter().map(|id| run_inline(ctx, *id))).await;
    for (id, result) in inline.iter().zip(results) {
        match result {
            Err(Error::Conversion { .. }) | Err(Error::Conflict(_)) | Ok(_) => {}
            Err(e) => tracing::error!(
                batch_id = %batch.id,
                job_id = %id,
                error = %e,
                "Inline child errored"
            ),
        }
    }

    Ok(BatchHandle {
        batch_id: batch.id,
        child_ids,
    })
}

async fn release(ctx: &Context, staged: &[BlobRef]) {
    for blob in staged {
        ctx.blobs.remove(blob).await;
    }
}
