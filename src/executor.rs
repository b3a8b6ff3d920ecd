//! Per-unit execution: run every feature function, merge, isolate faults.

use indexmap::IndexMap;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::config::CollisionPolicy;
use crate::constants::iteration::OPAQUE_PANIC_MESSAGE;
use crate::context::RunContext;
use crate::data::{CustomerRecord, FailureKind, FeatureMap, UnitFailure, UnitResult};
use crate::errors::FeatureError;
use crate::feature::{ExtraArgs, FeatureSet};
use crate::types::{FeatureName, MeterId};

/// Applies an ordered feature set to one record.
///
/// Merge rule: feature maps are merged in function order. Under
/// `CollisionPolicy::LastWriteWins` a later function's value replaces an
/// earlier one for the same key (the key keeps its first position). Under
/// `CollisionPolicy::Strict` a shared key aborts the run.
///
/// Fault rule: if any function errors or panics, the whole unit becomes a
/// `UnitResult::Failure`; no partially merged keys survive.
pub struct UnitExecutor<'a> {
    features: &'a FeatureSet,
    policy: CollisionPolicy,
}

impl<'a> UnitExecutor<'a> {
    pub fn new(features: &'a FeatureSet, policy: CollisionPolicy) -> Self {
        Self { features, policy }
    }

    /// Executor configured from the context's feature set and policy.
    pub fn for_context(ctx: &'a RunContext) -> Self {
        Self::new(ctx.features(), ctx.config().collision_policy)
    }

    /// Run every feature function against `record`.
    ///
    /// Returns `Err` only for a strict-mode key collision; every other fault
    /// is contained in the returned `UnitResult::Failure`.
    pub fn execute(
        &self,
        record: &CustomerRecord,
        ctx: &RunContext,
        extra: &ExtraArgs,
    ) -> Result<UnitResult, FeatureError> {
        let mut merged = FeatureMap::new();
        let mut owners: IndexMap<FeatureName, &str> = IndexMap::new();
        for function in self.features.iter() {
            let name = function.name();
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| function.compute(record, ctx, extra)));
            let emitted = match outcome {
                Ok(Ok(emitted)) => emitted,
                Ok(Err(err)) => {
                    return Ok(failure(
                        &record.id,
                        FailureKind::FeatureComputation,
                        Some(name),
                        err.to_string(),
                    ));
                }
                Err(payload) => {
                    return Ok(failure(
                        &record.id,
                        FailureKind::Panic,
                        Some(name),
                        panic_message(payload.as_ref()),
                    ));
                }
            };
            for (key, value) in emitted {
                if let Some(first) = owners.get(&key) {
                    if self.policy == CollisionPolicy::Strict {
                        return Err(FeatureError::KeyCollision {
                            key,
                            first: first.to_string(),
                            second: name.to_string(),
                        });
                    }
                    debug!(
                        meter_id = %record.id,
                        feature_key = %key,
                        overwritten_by = name,
                        previous_owner = *first,
                        "feature key overwritten"
                    );
                }
                owners.insert(key.clone(), name);
                merged.insert(key, value);
            }
        }
        Ok(UnitResult::Features(merged))
    }
}

/// Build a failure sentinel and report it on the log channel.
pub(crate) fn failure(
    id: &MeterId,
    kind: FailureKind,
    feature: Option<&str>,
    message: String,
) -> UnitResult {
    warn!(
        meter_id = %id,
        feature = feature.unwrap_or("-"),
        kind = ?kind,
        error = %message,
        "unit recorded as failure"
    );
    UnitResult::Failure(UnitFailure {
        kind,
        feature: feature.map(str::to_string),
        message,
    })
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        OPAQUE_PANIC_MESSAGE.to_string()
    }
}
