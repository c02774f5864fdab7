use std::sync::Arc;
use std::time::Duration;

use panelforge_contracts::artifacts::{now_utc_iso, Artifact};
use panelforge_contracts::batch::{BatchProgress, BatchReport, ItemOutcome, ItemResult};
use panelforge_contracts::events::BatchEvent;
use panelforge_contracts::naming::compact_timestamp;
use panelforge_contracts::styles::ComicStyle;
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{FailureKind, ForgeError};
use crate::map_object;
use crate::plan::{BatchItem, BatchPlan};
use crate::providers::{ImageGenerator, ImageJob};
use crate::sessions::{SessionJournal, SessionStore};

/// Per-item retry schedule, keyed by failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRetryPolicy {
    pub max_attempts: u32,
    pub content_policy_delay_min: Duration,
    pub content_policy_delay_max: Duration,
    pub transport_delay: Duration,
}

impl Default for ItemRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            content_policy_delay_min: Duration::from_millis(3000),
            content_policy_delay_max: Duration::from_millis(5000),
            transport_delay: Duration::from_millis(2000),
        }
    }
}

impl ItemRetryPolicy {
    /// `None` means the failure is final.
    pub fn delay_for(&self, kind: FailureKind) -> Option<Duration> {
        match kind {
            FailureKind::Terminal => None,
            FailureKind::Transport => Some(self.transport_delay),
            FailureKind::ContentPolicy => {
                let min = self.content_policy_delay_min;
                let max = self.content_policy_delay_max.max(min);
                if min == max {
                    return Some(min);
                }
                Some(rand::thread_rng().gen_range(min..=max))
            }
        }
    }
}

/// One generated item, or the error that ended its last attempt.
#[derive(Debug)]
pub struct ItemRun {
    pub attempts: u32,
    pub outcome: Result<Artifact, ForgeError>,
}

/// Runs plans item by item against one session. Items never run
/// concurrently within a batch and one failed item never ends the batch.
#[derive(Clone)]
pub struct BatchDriver {
    generator: Arc<dyn ImageGenerator>,
    store: Arc<SessionStore>,
    retry: ItemRetryPolicy,
}

impl BatchDriver {
    pub fn new(generator: Arc<dyn ImageGenerator>, store: Arc<SessionStore>) -> Self {
        Self {
            generator,
            store,
            retry: ItemRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: ItemRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(
        &self,
        session_id: &str,
        plan: &BatchPlan,
        size: &str,
        style: &ComicStyle,
        on_event: &mut (dyn FnMut(BatchEvent) + Send),
    ) -> Result<BatchReport, ForgeError> {
        let journal = self.store.open_session(session_id).await?;
        let started_at = now_utc_iso();
        let total = plan.len();
        info!(session_id, total, style = %style.name, "batch started");
        journal
            .record(
                "batch_started",
                map_object(json!({
                    "title": plan.title,
                    "total": total,
                    "size": size,
                    "style": style.name,
                })),
            )
            .await;

        let mut results = Vec::with_capacity(total);
        for item in &plan.items {
            let run = self.generate_item(session_id, &journal, item, size, style).await;
            let (outcome, file_name, message) = match run.outcome {
                Ok(artifact) => {
                    let file_name = artifact.file_name.clone();
                    (ItemOutcome::Success { artifact }, Some(file_name), None)
                }
                Err(err) => {
                    let message = err.user_message();
                    (
                        ItemOutcome::Failed {
                            error_kind: err.failure_class(),
                            message: message.clone(),
                        },
                        None,
                        Some(message),
                    )
                }
            };
            let result = ItemResult {
                index: item.index,
                slot: item.slot,
                attempts: run.attempts,
                outcome,
            };
            on_event(BatchEvent::Progress(BatchProgress {
                session_id: session_id.to_string(),
                index: item.index,
                slot: item.slot,
                completed: results.len() + 1,
                total,
                ok: result.is_success(),
                file_name,
                message,
            }));
            results.push(result);
        }

        let report = BatchReport::new(session_id, started_at, now_utc_iso(), results);
        if let Err(err) = self.store.write_report(session_id, &report).await {
            warn!(session_id, error = %err, "batch report not persisted");
        }
        journal
            .record(
                "batch_finished",
                map_object(json!({
                    "success_count": report.success_count,
                    "error_count": report.error_count,
                })),
            )
            .await;
        info!(
            session_id,
            success_count = report.success_count,
            error_count = report.error_count,
            "batch finished"
        );
        on_event(BatchEvent::Complete {
            report: report.clone(),
        });
        Ok(report)
    }

    /// Generates and stores a single item with the per-item retry schedule.
    /// The session must already be open.
    pub async fn generate_item(
        &self,
        session_id: &str,
        journal: &SessionJournal,
        item: &BatchItem,
        size: &str,
        style: &ComicStyle,
    ) -> ItemRun {
        let job = ImageJob {
            prompt: style.apply(&item.prompt),
            size: size.to_string(),
            slot: item.slot,
        };
        journal
            .record(
                "item_started",
                map_object(json!({"index": item.index, "slot": item.slot, "prompt": job.prompt})),
            )
            .await;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.attempt_item(session_id, item, &job, attempt).await;
            let err = match outcome {
                Ok(artifact) => {
                    journal
                        .record(
                            "item_completed",
                            map_object(json!({
                                "index": item.index,
                                "slot": item.slot,
                                "attempts": attempt,
                                "file_name": artifact.file_name,
                            })),
                        )
                        .await;
                    return ItemRun {
                        attempts: attempt,
                        outcome: Ok(artifact),
                    };
                }
                Err(err) => err,
            };

            let delay = self.retry.delay_for(err.kind()).filter(|_| attempt < max_attempts);
            let Some(delay) = delay else {
                warn!(
                    session_id,
                    index = item.index,
                    slot = %item.slot,
                    attempt,
                    error = %err,
                    "item failed"
                );
                journal
                    .record(
                        "item_failed",
                        map_object(json!({
                            "index": item.index,
                            "slot": item.slot,
                            "attempts": attempt,
                            "error_kind": err.failure_class(),
                            "error": err.to_string(),
                        })),
                    )
                    .await;
                return ItemRun {
                    attempts: attempt,
                    outcome: Err(err),
                };
            };

            warn!(
                session_id,
                index = item.index,
                slot = %item.slot,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "item attempt failed; retrying"
            );
            journal
                .record(
                    "item_retry",
                    map_object(json!({
                        "index": item.index,
                        "slot": item.slot,
                        "attempt": attempt,
                        "error_kind": err.failure_class(),
                        "delay_ms": delay.as_millis() as u64,
                    })),
                )
                .await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt_item(
        &self,
        session_id: &str,
        item: &BatchItem,
        job: &ImageJob,
        attempt: u32,
    ) -> Result<Artifact, ForgeError> {
        let image = self.generator.generate(job).await?;
        for warning in &image.warnings {
            warn!(session_id, slot = %item.slot, "{warning}");
        }
        let file_name = format!(
            "{}-{}-{}.{}",
            item.slot.file_prefix(),
            compact_timestamp(),
            short_id(&job.prompt, attempt),
            image.extension
        );
        self.store
            .write_artifact(session_id, &image.bytes, &file_name, item.slot, &item.description)
            .await
    }
}

fn short_id(prompt: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use panelforge_contracts::artifacts::ArtifactSlot;
    use panelforge_contracts::batch::{FailureClass, ItemOutcome};
    use panelforge_contracts::events::BatchEvent;
    use panelforge_contracts::script::{Scene, StoryboardScript};
    use panelforge_contracts::styles::StyleRegistry;
    use serde_json::Value;

    use super::{BatchDriver, ItemRetryPolicy};
    use crate::error::{FailureKind, ForgeError};
    use crate::plan::BatchPlan;
    use crate::providers::{GeneratedImage, ImageGenerator, ImageJob};
    use crate::sessions::SessionStore;
    use crate::upstream::{TransportCause, UpstreamError};

    /// Behaviour keyed by a marker word in the prompt.
    #[derive(Default)]
    struct ScriptedGenerator {
        calls: Mutex<HashMap<String, u32>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn calls_for(&self, marker: &str) -> u32 {
            self.calls
                .lock()
                .map(|calls| calls.get(marker).copied().unwrap_or(0))
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, job: &ImageJob) -> Result<GeneratedImage, ForgeError> {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(job.prompt.clone());
            }
            let marker = ["reject", "flaky", "broken"]
                .into_iter()
                .find(|marker| job.prompt.contains(*marker))
                .unwrap_or("ok");
            let call = {
                let mut calls = self.calls.lock().map_err(|_| {
                    ForgeError::MalformedContent("poisoned".to_string())
                })?;
                let count = calls.entry(marker.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            match (marker, call) {
                ("reject", _) => Err(ForgeError::ContentRejected {
                    message: "flagged".to_string(),
                    status: Some(400),
                }),
                ("flaky", 1) => Err(ForgeError::UpstreamUnavailable(UpstreamError {
                    endpoint: "http://upstream.test".to_string(),
                    attempts: 3,
                    status: None,
                    body: String::new(),
                    cause: TransportCause::Timeout(Duration::from_secs(60)),
                })),
                ("broken", _) => Err(ForgeError::MalformedContent("no data".to_string())),
                _ => Ok(GeneratedImage {
                    bytes: b"\x89PNG fake".to_vec(),
                    extension: "png".to_string(),
                    warnings: Vec::new(),
                }),
            }
        }
    }

    fn instant_retries() -> ItemRetryPolicy {
        ItemRetryPolicy {
            max_attempts: 3,
            content_policy_delay_min: Duration::ZERO,
            content_policy_delay_max: Duration::ZERO,
            transport_delay: Duration::ZERO,
        }
    }

    fn scene(n: u32, description: &str) -> Scene {
        Scene {
            scene_number: n,
            description: description.to_string(),
            visual_elements: "ink".to_string(),
        }
    }

    #[test]
    fn retry_delays_follow_failure_kind() {
        let policy = ItemRetryPolicy::default();
        assert_eq!(policy.delay_for(FailureKind::Terminal), None);
        assert_eq!(
            policy.delay_for(FailureKind::Transport),
            Some(Duration::from_millis(2000))
        );
        for _ in 0..20 {
            let delay = policy
                .delay_for(FailureKind::ContentPolicy)
                .unwrap_or_default();
            assert!(delay >= Duration::from_millis(3000) && delay <= Duration::from_millis(5000));
        }
    }

    #[tokio::test]
    async fn partial_failures_are_isolated_and_counted() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(SessionStore::open(root.path()).await?);
        let generator = Arc::new(ScriptedGenerator::default());
        let driver = BatchDriver::new(generator.clone(), store.clone())
            .with_retry_policy(instant_retries());

        let script = StoryboardScript {
            title: "Storm".to_string(),
            storyboard: vec![
                scene(1, "calm harbor"),
                scene(2, "reject this scene"),
                scene(3, "flaky weather"),
                scene(4, "broken bridge"),
            ],
        };
        let plan = BatchPlan::from_script(&script, true);
        let style = StyleRegistry::new(None)
            .fallback()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no default style"))?;
        let session_id = store.create_session().await?;

        let mut events = Vec::new();
        let report = driver
            .run(&session_id, &plan, "4:3", &style, &mut |event| events.push(event))
            .await?;

        assert_eq!(report.total(), 5);
        assert_eq!(report.success_count + report.error_count, 5);
        assert_eq!(report.success_count, 3);
        let indexes: Vec<usize> = report.results.iter().map(|row| row.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        let attempts: Vec<u32> = report.results.iter().map(|row| row.attempts).collect();
        assert_eq!(attempts, vec![1, 1, 3, 2, 1]);
        assert!(matches!(
            report.results[2].outcome,
            ItemOutcome::Failed { error_kind: FailureClass::ContentRejected, .. }
        ));
        assert!(matches!(
            report.results[4].outcome,
            ItemOutcome::Failed { error_kind: FailureClass::MalformedContent, .. }
        ));
        assert_eq!(generator.calls_for("reject"), 3);
        assert_eq!(generator.calls_for("broken"), 1);
        assert_eq!(generator.calls_for("ok"), 2);

        let progress: Vec<(usize, bool)> = events
            .iter()
            .filter_map(|event| match event {
                BatchEvent::Progress(progress) => Some((progress.completed, progress.ok)),
                _ => None,
            })
            .collect();
        assert_eq!(
            progress,
            vec![(1, true), (2, true), (3, false), (4, true), (5, false)]
        );
        assert!(matches!(events.last(), Some(BatchEvent::Complete { .. })));

        let listed = store.list_artifacts(&session_id).await?;
        let slots: Vec<ArtifactSlot> = listed.iter().map(|row| row.slot).collect();
        assert_eq!(
            slots,
            vec![ArtifactSlot::Cover, ArtifactSlot::Panel(1), ArtifactSlot::Panel(3)]
        );

        let session_dir = root.path().join(&session_id);
        assert!(session_dir.join("report.json").exists());
        let journal = std::fs::read_to_string(session_dir.join("events.jsonl"))?;
        let kinds: Vec<String> = journal
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("batch_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("batch_finished"));
        assert_eq!(kinds.iter().filter(|kind| *kind == "item_retry").count(), 3);
        assert_eq!(kinds.iter().filter(|kind| *kind == "item_failed").count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn prompts_carry_the_style_prefix_in_plan_order() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(SessionStore::open(root.path()).await?);
        let generator = Arc::new(ScriptedGenerator::default());
        let driver = BatchDriver::new(generator.clone(), store.clone())
            .with_retry_policy(instant_retries());
        let style = StyleRegistry::new(None)
            .get("comic_japanese")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing style"))?;
        let script = StoryboardScript {
            title: "Two".to_string(),
            storyboard: vec![scene(2, "second"), scene(1, "first")],
        };
        let plan = BatchPlan::from_script(&script, false);
        let session_id = store.create_session().await?;

        driver
            .run(&session_id, &plan, "1:1", &style, &mut |_| {})
            .await?;
        let prompts = generator
            .prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default();
        assert_eq!(prompts.len(), 2);
        for prompt in &prompts {
            assert!(prompt.starts_with(&format!("{}, ", style.system_prompt.trim())));
        }
        assert!(prompts[0].contains("first"));
        assert!(prompts[1].contains("second"));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_session_id_fails_before_generation() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(SessionStore::open(root.path()).await?);
        let generator = Arc::new(ScriptedGenerator::default());
        let driver = BatchDriver::new(generator.clone(), store);
        let style = StyleRegistry::new(None)
            .fallback()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no default style"))?;
        let plan = BatchPlan::from_script(
            &StoryboardScript {
                title: String::new(),
                storyboard: vec![scene(1, "x")],
            },
            false,
        );

        let result = driver
            .run("../escape", &plan, "1:1", &style, &mut |_| {})
            .await;
        assert!(matches!(result, Err(ForgeError::NotFound(_))));
        assert_eq!(generator.calls_for("ok"), 0);
        Ok(())
    }
}
