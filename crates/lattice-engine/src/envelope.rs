use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use lattice_core::config::ModelRole;
use lattice_core::state::RunState;
use lattice_core::types::{ChatMessage, JobId, PipelineEvent, StepOutput, StepResult};
use lattice_store::CacheEntry;

use crate::budget::{budget_context, estimate_tokens};
use crate::context::EngineContext;
use crate::extract::extract_json;

const JSON_ONLY_SUFFIX: &str = "\n\nIMPORTANT: Output ONLY valid JSON.";

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Execute one LLM-backed step inside the full envelope: budget the input,
/// consult the content-addressed cache, invoke the provider with retry,
/// extract structured output, persist, and emit telemetry.
///
/// Never returns a transport error: every failure becomes a
/// [`StepResult::Failure`] that the caller records into findings/history.
pub async fn run_step(
    ctx: &EngineContext,
    step_id: &str,
    role: ModelRole,
    system_prompt: &str,
    state: &RunState,
) -> StepResult {
    let job_id = JobId::from_str(&state.job_id);
    let model = ctx.config.llm.model_for_role(role).to_string();
    let start = Instant::now();

    let context = budget_context(
        state,
        ctx.config.budget.max_context_tokens,
        ctx.config.budget.reserve_tokens,
    );
    debug!(step = step_id, tokens = estimate_tokens(&context), "Step context ready");

    // Key covers the step identity (id + prompt), the model, and the budgeted
    // input — one inference per distinct triple over the cache lifetime.
    let input_hash = sha256_hex(&format!("{}:{}:{}:{}", step_id, system_prompt, model, context));

    if ctx.config.cache.enabled {
        match ctx.cache.get(&input_hash) {
            Ok(Some(entry)) => {
                info!(step = step_id, hash = %&input_hash[..8], "Cache HIT");
                ctx.events.publish(PipelineEvent::StepCompleted {
                    job_id,
                    step: step_id.to_string(),
                    elapsed_ms: 0,
                    cached: true,
                });
                return StepResult::Success(StepOutput {
                    response: entry.response,
                    raw: entry.raw,
                    execution_time_ms: 0,
                    input_hash: entry.input_hash,
                    output_hash: entry.output_hash,
                    cached: true,
                });
            }
            Ok(None) => {
                info!(step = step_id, hash = %&input_hash[..8], "Cache MISS");
            }
            Err(e) => {
                // A broken cache degrades to a miss, never fails the step.
                warn!(step = step_id, error = %e, "Cache read failed");
            }
        }
    }

    ctx.events.publish(PipelineEvent::StepStarted {
        job_id: job_id.clone(),
        step: step_id.to_string(),
    });

    let messages = vec![
        ChatMessage::system(format!("{}{}", system_prompt, JSON_ONLY_SUFFIX)),
        ChatMessage::user(context),
    ];

    let handle = match ctx.pool.handle(&model).await {
        Ok(handle) => handle,
        Err(e) => {
            let error = e.to_string();
            ctx.events.publish(PipelineEvent::StepFailed {
                job_id,
                step: step_id.to_string(),
                error: error.clone(),
            });
            return StepResult::Failure { error };
        }
    };

    let response = match handle.invoke_with_retry(messages).await {
        Ok(response) => response,
        Err(e) => {
            let error = e.to_string();
            warn!(step = step_id, error = %error, "Step inference failed");
            ctx.events.publish(PipelineEvent::StepFailed {
                job_id,
                step: step_id.to_string(),
                error: error.clone(),
            });
            return StepResult::Failure { error };
        }
    };

    let parsed = extract_json(&response.content);
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let output_hash = sha256_hex(&response.content);

    let output = StepOutput {
        response: parsed,
        raw: response.content,
        execution_time_ms: elapsed_ms,
        input_hash: input_hash.clone(),
        output_hash,
        cached: false,
    };

    if ctx.config.cache.enabled {
        let entry = CacheEntry {
            response: output.response.clone(),
            raw: output.raw.clone(),
            step: step_id.to_string(),
            execution_time_ms: elapsed_ms,
            input_hash,
            output_hash: output.output_hash.clone(),
        };
        if let Err(e) = ctx.cache.put(&entry) {
            warn!(step = step_id, error = %e, "Cache write failed");
        }
    }

    info!(step = step_id, elapsed_ms, "Step complete");
    ctx.events.publish(PipelineEvent::StepCompleted {
        job_id,
        step: step_id.to_string(),
        elapsed_ms,
        cached: false,
    });

    StepResult::Success(output)
}
