use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::ExecutionLimits, error::ExecutionError};

/**
 * \brief 调用方提交的原始输入，限制项可缺省。
 */
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionInput {
    pub source_code: String,
    pub language_id: u32,
    #[serde(default)]
    pub memory_limit_kb: Option<u32>,
    #[serde(default)]
    pub time_limit_seconds: Option<f64>,
}

/**
 * \brief 发往执行后端的请求体，限制项恒有值。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRequest {
    pub source_code: String,
    pub language_id: u32,
    /** \brief KB */
    pub memory_limit: u32,
    /** \brief 秒 */
    pub time_limit: f64,
}

/**
 * \brief 以应用默认值补齐限制项。
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionBuilder {
    defaults: ExecutionLimits,
}

impl SubmissionBuilder {
    pub fn new(defaults: ExecutionLimits) -> Self {
        Self { defaults }
    }

    pub fn build(&self, input: SubmissionInput) -> SubmissionRequest {
        SubmissionRequest {
            source_code: input.source_code,
            language_id: input.language_id,
            memory_limit: input
                .memory_limit_kb
                .filter(|v| *v > 0)
                .unwrap_or(self.defaults.memory_limit_kb),
            time_limit: input
                .time_limit_seconds
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(self.defaults.time_limit_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub id: u32,
    #[serde(default)]
    pub description: String,
}

/**
 * \brief 执行后端的原始响应。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /** \brief 后端以字符串返回秒数，如 "0.012"。 */
    #[serde(default)]
    pub time: Option<String>,
    /** \brief KB */
    #[serde(default)]
    pub memory: Option<u64>,
    pub status: StatusInfo,
}

/**
 * \brief 执行状态（封闭集合，按 id 编号）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    InQueue = 1,
    Processing = 2,
    Accepted = 3,
    WrongAnswer = 4,
    TimeLimitExceeded = 5,
    CompilationError = 6,
    SegmentationFault = 7,
    FileSizeLimitExceeded = 8,
    FloatingPointException = 9,
    AbnormalTermination = 10,
    NonZeroExit = 11,
    RuntimeErrorOther = 12,
    InternalError = 13,
    ExecFormatError = 14,
}

impl ExecutionStatus {
    /** \brief 未知 id 归入 InternalError。 */
    pub fn from_id(id: u32) -> Self {
        match id {
            1 => Self::InQueue,
            2 => Self::Processing,
            3 => Self::Accepted,
            4 => Self::WrongAnswer,
            5 => Self::TimeLimitExceeded,
            6 => Self::CompilationError,
            7 => Self::SegmentationFault,
            8 => Self::FileSizeLimitExceeded,
            9 => Self::FloatingPointException,
            10 => Self::AbnormalTermination,
            11 => Self::NonZeroExit,
            12 => Self::RuntimeErrorOther,
            14 => Self::ExecFormatError,
            _ => Self::InternalError,
        }
    }

    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::InQueue => "In Queue",
            Self::Processing => "Processing",
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::CompilationError => "Compilation Error",
            Self::SegmentationFault => "Runtime Error: Segmentation Fault",
            Self::FileSizeLimitExceeded => "Runtime Error: File Size Limit Exceeded",
            Self::FloatingPointException => "Runtime Error: Floating Point Exception",
            Self::AbnormalTermination => "Runtime Error: Abnormal Program Termination",
            Self::NonZeroExit => "Runtime Error: Non-Zero Exit Code",
            Self::RuntimeErrorOther => "Runtime Error",
            Self::InternalError => "Internal Error",
            Self::ExecFormatError => "Exec Format Error",
        }
    }

    /** \brief id ≥ 5 为需要展示的错误。 */
    pub fn is_error(&self) -> bool {
        self.id() >= 5
    }
}

/**
 * \brief 错误横幅内容。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBanner {
    pub category: String,
    pub description: String,
    pub detail: Option<String>,
}

/**
 * \brief 规整后的执行结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionOutcome {
    pub status: ExecutionStatus,
    pub result: SubmissionResult,
}

impl From<SubmissionResult> for SubmissionOutcome {
    fn from(result: SubmissionResult) -> Self {
        Self {
            status: ExecutionStatus::from_id(result.status.id),
            result,
        }
    }
}

impl SubmissionOutcome {
    /**
     * \brief 错误状态下生成横幅；详情依次取编译输出、标准错误、后端消息。
     */
    pub fn banner(&self) -> Option<ErrorBanner> {
        if !self.status.is_error() {
            return None;
        }
        let detail = [
            &self.result.compile_output,
            &self.result.stderr,
            &self.result.message,
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned();
        Some(ErrorBanner {
            category: self.status.description().to_string(),
            description: if self.result.status.description.is_empty() {
                self.status.description().to_string()
            } else {
                self.result.status.description.clone()
            },
            detail,
        })
    }
}

/**
 * \brief 执行后端支持的语言。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub id: u32,
    pub name: String,
}

/**
 * \brief 编辑器可渲染的语言：后端语言 id 到编辑器语言标识。
 */
pub const EDITOR_LANGUAGES: &[(u32, &str)] = &[
    (48, "c"),
    (49, "c"),
    (50, "c"),
    (75, "c"),
    (52, "cpp"),
    (53, "cpp"),
    (54, "cpp"),
    (76, "cpp"),
    (51, "csharp"),
    (60, "go"),
    (62, "java"),
    (63, "javascript"),
    (74, "typescript"),
    (78, "kotlin"),
    (64, "lua"),
    (85, "perl"),
    (70, "python"),
    (71, "python"),
    (72, "ruby"),
    (73, "rust"),
    (82, "sql"),
    (83, "swift"),
];

/** \brief 查询编辑器语言标识。 */
pub fn editor_language(language_id: u32) -> Option<&'static str> {
    EDITOR_LANGUAGES
        .iter()
        .find(|(id, _)| *id == language_id)
        .map(|(_, tag)| *tag)
}

/**
 * \brief 执行后端客户端。
 */
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit(
        &self,
        owner: &str,
        request: &SubmissionRequest,
    ) -> Result<SubmissionResult, ExecutionError>;

    async fn languages(&self, owner: &str) -> Result<Vec<Language>, ExecutionError>;
}

/**
 * \brief 基于 reqwest 的执行后端客户端（同步等待模式）。
 */
pub struct HttpExecutionClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExecutionClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ExecutionError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecutionError::TransportFailed {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ExecutionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit(
        &self,
        owner: &str,
        request: &SubmissionRequest,
    ) -> Result<SubmissionResult, ExecutionError> {
        let url = format!("{}/submissions?wait=true", self.base_url);
        let resp = self
            .http
            .post(url)
            .header("X-User-Id", owner)
            .json(request)
            .send()
            .await
            .map_err(|e| ExecutionError::Unreachable(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn languages(&self, owner: &str) -> Result<Vec<Language>, ExecutionError> {
        let url = format!("{}/languages", self.base_url);
        let resp = self
            .http
            .get(url)
            .header("X-User-Id", owner)
            .send()
            .await
            .map_err(|e| ExecutionError::Unreachable(e.to_string()))?;
        Self::decode(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input(memory: Option<u32>, time: Option<f64>) -> SubmissionInput {
        SubmissionInput {
            source_code: "print(1)".to_string(),
            language_id: 71,
            memory_limit_kb: memory,
            time_limit_seconds: time,
        }
    }

    fn result(id: u32) -> SubmissionResult {
        SubmissionResult {
            stdout: None,
            stderr: None,
            compile_output: None,
            message: None,
            token: None,
            time: None,
            memory: None,
            status: StatusInfo {
                id,
                description: ExecutionStatus::from_id(id).description().to_string(),
            },
        }
    }

    #[test]
    fn test_builder_fills_defaults() {
        let b = SubmissionBuilder::new(ExecutionLimits::default());
        let req = b.build(input(None, None));
        assert_eq!(req.memory_limit, 128_000);
        assert_eq!(req.time_limit, 5.0);

        let req = b.build(input(Some(64_000), Some(2.0)));
        assert_eq!(req.memory_limit, 64_000);
        assert_eq!(req.time_limit, 2.0);

        let req = b.build(input(Some(0), Some(f64::NAN)));
        assert_eq!(req.memory_limit, 128_000);
        assert_eq!(req.time_limit, 5.0);
    }

    #[test]
    fn test_request_wire_shape() {
        let req = SubmissionBuilder::default().build(input(None, None));
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "source_code": "print(1)",
                "language_id": 71,
                "memory_limit": 128000,
                "time_limit": 5.0
            })
        );
    }

    #[test]
    fn test_status_taxonomy() {
        for id in 1..=14 {
            let status = ExecutionStatus::from_id(id);
            assert_eq!(status.id(), id);
            assert_eq!(status.is_error(), id >= 5);
        }
        assert_eq!(ExecutionStatus::from_id(0), ExecutionStatus::InternalError);
        assert_eq!(ExecutionStatus::from_id(99), ExecutionStatus::InternalError);
        assert_eq!(
            ExecutionStatus::from_id(7).description(),
            "Runtime Error: Segmentation Fault"
        );
    }

    #[test]
    fn test_banner_only_for_errors() {
        for id in 1..=4 {
            assert!(SubmissionOutcome::from(result(id)).banner().is_none());
        }
        let mut r = result(6);
        r.stderr = Some("warning".to_string());
        r.compile_output = Some("main.c:1: error".to_string());
        let banner = SubmissionOutcome::from(r).banner().expect("banner");
        assert_eq!(banner.category, "Compilation Error");
        assert_eq!(banner.detail.as_deref(), Some("main.c:1: error"));

        let mut r = result(11);
        r.compile_output = Some(String::new());
        r.stderr = Some("Traceback".to_string());
        let banner = SubmissionOutcome::from(r).banner().expect("banner");
        assert_eq!(banner.detail.as_deref(), Some("Traceback"));

        let mut r = result(13);
        r.message = Some("box error".to_string());
        assert_eq!(
            SubmissionOutcome::from(r).banner().unwrap().detail.as_deref(),
            Some("box error")
        );
    }

    #[test]
    fn test_editor_language_map() {
        assert_eq!(editor_language(71), Some("python"));
        assert_eq!(editor_language(76), Some("cpp"));
        assert_eq!(editor_language(73), Some("rust"));
        assert_eq!(editor_language(1), None);
    }

    #[tokio::test]
    async fn test_submit_posts_wait_request_with_owner() {
        let server = MockServer::start().await;
        let req = SubmissionBuilder::default().build(input(None, None));
        Mock::given(method("POST"))
            .and(path("/submissions"))
            .and(query_param("wait", "true"))
            .and(header("X-User-Id", "u1"))
            .and(body_json(&req))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "stdout": "1\n",
                "stderr": null,
                "compile_output": null,
                "message": null,
                "token": "abc",
                "time": "0.012",
                "memory": 3200,
                "status": {"id": 3, "description": "Accepted"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpExecutionClient::new(reqwest::Client::new(), &server.uri());
        let res = client.submit("u1", &req).await.expect("submit");
        assert_eq!(res.stdout.as_deref(), Some("1\n"));
        assert_eq!(res.status.id, 3);
        assert_eq!(res.memory, Some(3200));
    }

    #[tokio::test]
    async fn test_submit_maps_non_success_to_transport_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let client = HttpExecutionClient::new(reqwest::Client::new(), &server.uri());
        let req = SubmissionBuilder::default().build(input(None, None));
        let err = client.submit("u1", &req).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TransportFailed { status: 429, .. }));
        assert_eq!(
            err.user_message(),
            "Daily submission limit reached. Try again later."
        );
    }

    #[tokio::test]
    async fn test_languages_are_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/languages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 71, "name": "Python (3.8.1)"},
                {"id": 44, "name": "Executable"}
            ])))
            .mount(&server)
            .await;

        let client = HttpExecutionClient::new(reqwest::Client::new(), &format!("{}/", server.uri()));
        let langs = client.languages("u1").await.expect("languages");
        assert_eq!(langs.len(), 2);
        assert_eq!(langs[0].name, "Python (3.8.1)");
    }
}
