use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ExecutionError,
    execution::{
        editor_language, ExecutionClient, Language, SubmissionBuilder, SubmissionInput,
        SubmissionOutcome,
    },
    telemetry,
};

/**
 * \brief 单次提交的状态。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    Submitting,
    Completed(SubmissionOutcome),
    TransportFailed(String),
    Cancelled,
}

/**
 * \brief 会话级语言目录：与用户无关，首次成功获取后共享。
 * \details 获取失败不缓存，下次调用重新获取。
 */
pub struct LanguageCatalog {
    client: Arc<dyn ExecutionClient>,
    languages: OnceCell<Vec<Language>>,
}

impl LanguageCatalog {
    pub fn new(client: Arc<dyn ExecutionClient>) -> Self {
        Self {
            client,
            languages: OnceCell::new(),
        }
    }

    /**
     * \brief 仅保留编辑器可渲染的语言并按名称排序。
     */
    pub async fn languages(&self, owner: &str) -> Result<Vec<Language>, ExecutionError> {
        let cached = self
            .languages
            .get_or_try_init(|| async {
                let mut langs: Vec<Language> = self
                    .client
                    .languages(owner)
                    .await?
                    .into_iter()
                    .filter(|l| editor_language(l.id).is_some())
                    .collect();
                langs.sort_by(|a, b| a.name.cmp(&b.name));
                Ok::<_, ExecutionError>(langs)
            })
            .await?;
        Ok(cached.clone())
    }
}

/**
 * \brief 提交编排器：持有当前尝试的状态，语言目录可与其他编排器共享。
 * \details 每次提交都是一次全新尝试，不做自动重试。
 */
pub struct SubmissionOrchestrator {
    client: Arc<dyn ExecutionClient>,
    builder: SubmissionBuilder,
    state: RwLock<AttemptState>,
    catalog: Arc<LanguageCatalog>,
}

impl SubmissionOrchestrator {
    pub fn new(client: Arc<dyn ExecutionClient>, builder: SubmissionBuilder) -> Self {
        let catalog = Arc::new(LanguageCatalog::new(client.clone()));
        Self::with_catalog(client, builder, catalog)
    }

    pub fn with_catalog(
        client: Arc<dyn ExecutionClient>,
        builder: SubmissionBuilder,
        catalog: Arc<LanguageCatalog>,
    ) -> Self {
        Self {
            client,
            builder,
            state: RwLock::new(AttemptState::Idle),
            catalog,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(AttemptState::Idle)
    }

    pub fn is_submitting(&self) -> bool {
        matches!(self.state(), AttemptState::Submitting)
    }

    fn set_state(&self, next: AttemptState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = next;
        }
    }

    /** \brief 回到 Idle（用户关闭结果面板）。 */
    pub fn clear(&self) {
        self.set_state(AttemptState::Idle);
    }

    /**
     * \brief 提交代码并等待结果。状态：Idle → Submitting → {Completed | TransportFailed | Cancelled}。
     */
    pub async fn submit(
        &self,
        owner: &str,
        input: SubmissionInput,
        cancel: &CancellationToken,
    ) -> Result<SubmissionOutcome, ExecutionError> {
        let request = self.builder.build(input);
        self.set_state(AttemptState::Submitting);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            res = self.client.submit(owner, &request) => res,
        };

        match result {
            Ok(result) => {
                let outcome = SubmissionOutcome::from(result);
                telemetry::log_event(
                    "execution.submit",
                    &format!(
                        "owner={} language_id={} status={}",
                        owner,
                        request.language_id,
                        outcome.status.id()
                    ),
                );
                self.set_state(AttemptState::Completed(outcome.clone()));
                Ok(outcome)
            }
            Err(ExecutionError::Cancelled) => {
                self.set_state(AttemptState::Cancelled);
                Err(ExecutionError::Cancelled)
            }
            Err(err) => {
                telemetry::log_error(
                    "execution.submit",
                    &format!("owner={} code={} detail={}", owner, err.code(), err),
                );
                self.set_state(AttemptState::TransportFailed(err.user_message()));
                Err(err)
            }
        }
    }

    pub async fn languages(&self, owner: &str) -> Result<Vec<Language>, ExecutionError> {
        self.catalog.languages(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExecutionLimits,
        execution::{StatusInfo, SubmissionRequest, SubmissionResult},
    };
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    struct FakeClient {
        status: u32,
        fail_with: Option<u16>,
        language_calls: AtomicUsize,
        language_failures_left: AtomicUsize,
        submitted: Mutex<Vec<SubmissionRequest>>,
        hang: bool,
    }

    impl FakeClient {
        fn new(status: u32) -> Self {
            Self {
                status,
                fail_with: None,
                language_calls: AtomicUsize::new(0),
                language_failures_left: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl ExecutionClient for FakeClient {
        async fn submit(
            &self,
            _owner: &str,
            request: &SubmissionRequest,
        ) -> Result<SubmissionResult, ExecutionError> {
            self.submitted.lock().unwrap().push(request.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(status) = self.fail_with {
                return Err(ExecutionError::TransportFailed {
                    status,
                    body: String::new(),
                });
            }
            Ok(SubmissionResult {
                stdout: Some("ok".to_string()),
                stderr: None,
                compile_output: None,
                message: None,
                token: None,
                time: Some("0.01".to_string()),
                memory: Some(100),
                status: StatusInfo {
                    id: self.status,
                    description: String::new(),
                },
            })
        }

        async fn languages(&self, _owner: &str) -> Result<Vec<Language>, ExecutionError> {
            self.language_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .language_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExecutionError::Unreachable("down".to_string()));
            }
            Ok(vec![
                Language {
                    id: 71,
                    name: "Python (3.8.1)".to_string(),
                },
                Language {
                    id: 44,
                    name: "Executable".to_string(),
                },
                Language {
                    id: 54,
                    name: "C++ (GCC 9.2.0)".to_string(),
                },
            ])
        }
    }

    fn orchestrator(client: FakeClient) -> (Arc<FakeClient>, SubmissionOrchestrator) {
        let client = Arc::new(client);
        let orch = SubmissionOrchestrator::new(
            client.clone(),
            SubmissionBuilder::new(ExecutionLimits::default()),
        );
        (client, orch)
    }

    fn input() -> SubmissionInput {
        SubmissionInput {
            source_code: "print(1)".to_string(),
            language_id: 71,
            memory_limit_kb: None,
            time_limit_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_submit_completes_with_defaults() {
        let (client, orch) = orchestrator(FakeClient::new(3));
        assert_eq!(orch.state(), AttemptState::Idle);
        let outcome = orch
            .submit("u1", input(), &CancellationToken::new())
            .await
            .expect("outcome");
        assert!(outcome.banner().is_none());
        assert!(!orch.is_submitting());
        assert!(matches!(orch.state(), AttemptState::Completed(_)));
        let sent = client.submitted.lock().unwrap().clone();
        assert_eq!(sent[0].memory_limit, 128_000);
        assert_eq!(sent[0].time_limit, 5.0);

        orch.clear();
        assert_eq!(orch.state(), AttemptState::Idle);
    }

    #[tokio::test]
    async fn test_error_status_still_completes() {
        let (_, orch) = orchestrator(FakeClient::new(5));
        let outcome = orch
            .submit("u1", input(), &CancellationToken::new())
            .await
            .expect("outcome");
        assert_eq!(
            outcome.banner().unwrap().category,
            "Time Limit Exceeded"
        );
    }

    #[tokio::test]
    async fn test_transport_failure_sets_state() {
        let mut fake = FakeClient::new(3);
        fake.fail_with = Some(503);
        let (_, orch) = orchestrator(fake);
        let err = orch
            .submit("u1", input(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_error");
        assert_eq!(
            orch.state(),
            AttemptState::TransportFailed("Error in request to Judge0, Status: 503".to_string())
        );
    }

    #[tokio::test]
    async fn test_is_submitting_during_call_and_cancel() {
        let mut fake = FakeClient::new(3);
        fake.hang = true;
        let (_, orch) = orchestrator(fake);
        let orch = Arc::new(orch);
        let cancel = CancellationToken::new();

        let task = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.submit("u1", input(), &cancel).await })
        };
        for _ in 0..50 {
            if orch.is_submitting() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(orch.is_submitting());
        cancel.cancel();
        let res = task.await.expect("join");
        assert!(matches!(res, Err(ExecutionError::Cancelled)));
        assert_eq!(orch.state(), AttemptState::Cancelled);
    }

    #[tokio::test]
    async fn test_languages_cached_filtered_sorted() {
        let (client, orch) = orchestrator(FakeClient::new(3));
        let first = orch.languages("u1").await.expect("languages");
        let second = orch.languages("u1").await.expect("languages");
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|l| l.id).collect::<Vec<_>>(),
            vec![54, 71]
        );
        assert_eq!(client.language_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_catalog_fetches_once_across_orchestrators() {
        let client = Arc::new(FakeClient::new(3));
        let catalog = Arc::new(LanguageCatalog::new(client.clone()));
        for owner in ["u1", "u2", "u3"] {
            let orch = SubmissionOrchestrator::with_catalog(
                client.clone(),
                SubmissionBuilder::default(),
                catalog.clone(),
            );
            assert_eq!(orch.languages(owner).await.expect("languages").len(), 2);
        }
        assert_eq!(client.language_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_language_fetch_is_not_cached() {
        let fake = FakeClient::new(3);
        fake.language_failures_left.store(1, Ordering::SeqCst);
        let (client, orch) = orchestrator(fake);
        assert!(orch.languages("u1").await.is_err());
        assert_eq!(orch.languages("u1").await.expect("retry").len(), 2);
        assert_eq!(client.language_calls.load(Ordering::SeqCst), 2);
    }
}
