//! Tool Registry and Dispatcher
//!
//! Maps tool names to capability providers plus an argument schema. The
//! registry is built once at startup and shared read-only by every session.
//!
//! Dispatch validates arguments before anything side-effecting happens,
//! respects a per-tool concurrency ceiling, and turns provider errors,
//! timeouts and panics into failed observations instead of propagating them.
//! Only conditions the loop must act on come back as errors: unknown tool,
//! invalid arguments, busy, and cancellation.

pub mod catalog;
pub mod http;
pub mod search;

use judge_sdk::capability::CapabilityProvider;
use judge_sdk::errors::JudgeError;
use judge_sdk::types::{ArgSchema, ProviderError, ProviderOutput};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::evidence::{FailureKind, Observation};
use crate::config::{BusyPolicy, FailurePolicy, ToolConfig};

/// Base delay between busy retries; multiplied by the attempt number
const BUSY_BACKOFF: Duration = Duration::from_millis(200);

/// Operational limits of one tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolLimits {
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub busy_policy: BusyPolicy,
    pub busy_retries: u32,
    pub failure_policy: FailurePolicy,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrency: 4,
            busy_policy: BusyPolicy::Queue,
            busy_retries: 2,
            failure_policy: FailurePolicy::Recoverable,
        }
    }
}

impl From<&ToolConfig> for ToolLimits {
    fn from(config: &ToolConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_concurrency: config.max_concurrency.max(1),
            busy_policy: config.busy_policy,
            busy_retries: config.busy_retries,
            failure_policy: config.failure_policy,
        }
    }
}

/// Static registry entry
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
    pub provider: Arc<dyn CapabilityProvider>,
    pub limits: ToolLimits,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("limits", &self.limits)
            .finish()
    }
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ArgSchema,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            provider,
            limits: ToolLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ToolLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
        }
    }
}

/// Public view of a tool, as shown to clients and the reasoning backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
}

struct RegisteredTool {
    spec: ToolSpec,
    permits: Arc<Semaphore>,
}

/// Registry of tools available to every session
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Fails with `DuplicateTool` if the name is taken.
    pub fn register(&mut self, spec: ToolSpec) -> Result<(), JudgeError> {
        if self.tools.contains_key(&spec.name) {
            return Err(JudgeError::DuplicateTool(spec.name));
        }
        debug!(
            "Registered tool '{}' (provider {}, concurrency {})",
            spec.name,
            spec.provider.name(),
            spec.limits.max_concurrency
        );
        let permits = Arc::new(Semaphore::new(spec.limits.max_concurrency.max(1)));
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, permits });
        Ok(())
    }

    /// Look up a tool. Fails with `UnknownTool` if absent.
    pub fn resolve(&self, name: &str) -> Result<&ToolSpec, JudgeError> {
        self.tools
            .get(name)
            .map(|t| &t.spec)
            .ok_or_else(|| JudgeError::UnknownTool(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors in name order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.spec.descriptor()).collect()
    }

    /// Validate and run one tool call.
    ///
    /// Provider trouble is reported inside the returned observation
    /// (`success = false`). A call still running when `cancel` fires gets
    /// `grace` to finish; after that its result is discarded and
    /// `Aborted` is returned.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &Value,
        cancel: &CancellationToken,
        grace: Duration,
    ) -> Result<Observation, JudgeError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| JudgeError::UnknownTool(name.to_string()))?;
        let spec = &tool.spec;

        let args = spec
            .schema
            .validate(arguments)
            .map_err(|problems| JudgeError::InvalidArguments {
                tool: name.to_string(),
                problems: problems.iter().map(ToString::to_string).collect(),
            })?;

        let permit = self.acquire(tool, cancel).await?;

        info!("Dispatching tool '{}'", name);
        let started = Instant::now();
        let provider = Arc::clone(&spec.provider);
        let timeout = spec.limits.timeout;

        // The permit lives with the call, so an abandoned call still counts
        // against the tool's concurrency until it returns.
        let mut call = tokio::spawn(async move {
            let _permit = permit;
            tokio::time::timeout(timeout, provider.invoke(&args)).await
        });

        let joined = tokio::select! {
            biased;
            joined = &mut call => joined,
            _ = cancel.cancelled() => {
                match tokio::time::timeout(grace, &mut call).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Abandoning in-flight call to '{}' after cancellation", name);
                        return Err(JudgeError::Aborted(format!(
                            "tool '{}' did not finish within the cancellation grace period",
                            name
                        )));
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let observation = match joined {
            Ok(Ok(Ok(output))) => from_output(name, arguments, output, duration_ms),
            Ok(Ok(Err(ProviderError::Timeout))) => Observation::failure(
                name,
                arguments.clone(),
                FailureKind::Timeout,
                "provider reported a timeout",
                duration_ms,
            ),
            Ok(Ok(Err(e))) => Observation::failure(
                name,
                arguments.clone(),
                FailureKind::Provider,
                e.to_string(),
                duration_ms,
            ),
            Ok(Err(_elapsed)) => Observation::failure(
                name,
                arguments.clone(),
                FailureKind::Timeout,
                format!("no result within {}s", timeout.as_secs_f64()),
                duration_ms,
            ),
            Err(join_error) if join_error.is_panic() => Observation::failure(
                name,
                arguments.clone(),
                FailureKind::Panic,
                "provider crashed while handling the call",
                duration_ms,
            ),
            Err(join_error) => Observation::failure(
                name,
                arguments.clone(),
                FailureKind::Provider,
                join_error.to_string(),
                duration_ms,
            ),
        };

        if observation.success {
            info!("Tool '{}' finished in {}ms", name, duration_ms);
        } else {
            warn!(
                "Tool '{}' returned no usable result after {}ms: {}",
                name,
                duration_ms,
                observation.error.as_deref().unwrap_or("unknown")
            );
        }

        Ok(observation)
    }

    /// Take a concurrency permit according to the tool's busy policy
    async fn acquire(
        &self,
        tool: &RegisteredTool,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, JudgeError> {
        let limits = &tool.spec.limits;
        let mut attempt = 0u32;

        loop {
            let acquired = match limits.busy_policy {
                BusyPolicy::Reject => Arc::clone(&tool.permits).try_acquire_owned().ok(),
                BusyPolicy::Queue => {
                    let wait = tokio::time::timeout(
                        limits.timeout,
                        Arc::clone(&tool.permits).acquire_owned(),
                    );
                    tokio::select! {
                        biased;
                        result = wait => match result {
                            Ok(Ok(permit)) => Some(permit),
                            Ok(Err(_closed)) => None,
                            Err(_elapsed) => None,
                        },
                        _ = cancel.cancelled() => {
                            return Err(JudgeError::Aborted(format!(
                                "cancelled while waiting for '{}'",
                                tool.spec.name
                            )));
                        }
                    }
                }
            };

            if let Some(permit) = acquired {
                return Ok(permit);
            }

            if attempt >= limits.busy_retries {
                return Err(JudgeError::ToolBusy(tool.spec.name.clone()));
            }
            attempt += 1;
            debug!(
                "Tool '{}' busy, retry {}/{}",
                tool.spec.name, attempt, limits.busy_retries
            );
            tokio::select! {
                _ = tokio::time::sleep(BUSY_BACKOFF * attempt) => {}
                _ = cancel.cancelled() => {
                    return Err(JudgeError::Aborted(format!(
                        "cancelled while waiting for '{}'",
                        tool.spec.name
                    )));
                }
            }
        }
    }
}

fn from_output(
    tool: &str,
    arguments: &Value,
    output: ProviderOutput,
    duration_ms: u64,
) -> Observation {
    let failure_kind = (!output.success).then_some(FailureKind::Domain);
    let error = if output.success {
        None
    } else {
        Some(
            output
                .detail
                .clone()
                .unwrap_or_else(|| "no result".to_string()),
        )
    };
    Observation {
        tool: tool.to_string(),
        arguments: arguments.clone(),
        payload: output.payload,
        confidence: output.confidence,
        success: output.success,
        error,
        failure_kind,
        timestamp: chrono::Utc::now(),
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use judge_sdk::types::{FieldSpec, FieldType, ToolArgs};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Found,
        Error,
        Panic,
        Sleep(Duration),
    }

    impl CountingProvider {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }
    }

    #[async_trait]
    impl CapabilityProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn invoke(&self, args: &ToolArgs) -> Result<ProviderOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Found => {
                    Ok(ProviderOutput::found(Value::Object(args.clone())).with_confidence(0.8))
                }
                Behaviour::Error => Err(ProviderError::Unavailable("connection refused".into())),
                Behaviour::Panic => panic!("engine exploded"),
                Behaviour::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(ProviderOutput::found(json!({})))
                }
            }
        }
    }

    fn ocr_spec(provider: Arc<CountingProvider>) -> ToolSpec {
        ToolSpec::new(
            "ocr",
            "Read text in an image",
            ArgSchema::new(vec![FieldSpec::required("image_url", FieldType::String)]),
            provider,
        )
    }

    fn args() -> Value {
        json!({"image_url": "https://cdn/x.jpg"})
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Found)))
            .unwrap();

        assert_eq!(registry.resolve("ocr").unwrap().name, "ocr");
        assert!(matches!(
            registry.resolve("exif"),
            Err(JudgeError::UnknownTool(name)) if name == "exif"
        ));
        assert!(matches!(
            registry.register(ocr_spec(CountingProvider::new(Behaviour::Found))),
            Err(JudgeError::DuplicateTool(_))
        ));
        assert_eq!(registry.names(), vec!["ocr"]);
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_provider() {
        let provider = CountingProvider::new(Behaviour::Found);
        let mut registry = ToolRegistry::new();
        registry.register(ocr_spec(Arc::clone(&provider))).unwrap();

        let err = registry
            .dispatch("ocr", &json!({"url": 1}), &CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap_err();

        match err {
            JudgeError::InvalidArguments { tool, problems } => {
                assert_eq!(tool, "ocr");
                assert_eq!(problems.len(), 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_dispatch_echoes_arguments() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Found)))
            .unwrap();

        let obs = registry
            .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        assert!(obs.success);
        assert_eq!(obs.arguments, args());
        assert_eq!(obs.confidence, Some(0.8));
        assert_eq!(obs.failure_kind, None);
    }

    #[tokio::test]
    async fn test_provider_error_becomes_failed_observation() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Error)))
            .unwrap();

        let obs = registry
            .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();

        assert!(!obs.success);
        assert_eq!(obs.failure_kind, Some(FailureKind::Provider));
        assert!(obs.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_provider_panic_is_isolated() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Panic)))
            .unwrap();

        let obs = registry
            .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(obs.failure_kind, Some(FailureKind::Panic));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ocr_spec(CountingProvider::new(Behaviour::Sleep(Duration::from_secs(5))))
                    .with_limits(ToolLimits {
                        timeout: Duration::from_millis(20),
                        ..ToolLimits::default()
                    }),
            )
            .unwrap();

        let obs = registry
            .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(obs.failure_kind, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_reject_policy_reports_busy() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ocr_spec(CountingProvider::new(Behaviour::Sleep(Duration::from_millis(300))))
                    .with_limits(ToolLimits {
                        max_concurrency: 1,
                        busy_policy: BusyPolicy::Reject,
                        busy_retries: 0,
                        ..ToolLimits::default()
                    }),
            )
            .unwrap();
        let registry = Arc::new(registry);

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = registry
            .dispatch("ocr", &args(), &CancellationToken::new(), Duration::ZERO)
            .await;
        assert!(matches!(second, Err(JudgeError::ToolBusy(_))));
        assert!(first.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn test_cancel_within_grace_keeps_result() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Sleep(
                Duration::from_millis(50),
            ))))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let obs = registry
            .dispatch("ocr", &args(), &cancel, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(obs.success);
    }

    #[tokio::test]
    async fn test_cancel_past_grace_abandons_call() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ocr_spec(CountingProvider::new(Behaviour::Sleep(
                Duration::from_secs(5),
            ))))
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = registry
            .dispatch("ocr", &args(), &cancel, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Aborted(_)));
    }
}
