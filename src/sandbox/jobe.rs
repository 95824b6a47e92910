use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Local;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{
    DetailFlags, HttpMethod, HttpResponse, HttpTransport, PollPolicy, ResultCode, RunSpec,
    Sandbox, SandboxError, SubmissionDetails, SubmissionHandle, SubmissionStatus,
};
use crate::language::main_class;

const API_PATH: &str = "jobe/index.php/restapi";
const RUN_TEMP_PREFIX: &str = "/home/jobe/runs/jobe_";

/// Outcome the service uses to say it is too busy to run anything
const OUTCOME_OVERLOAD: i64 = 21;

/// Connection settings for a [`JobeSandbox`]
#[derive(Debug, Clone, Default)]
pub struct JobeOptions {
    /// `host[:port]`, optionally with a scheme; `;` separates several servers
    pub host: String,
    pub api_key: Option<String>,
    /// Canonical language name to the service's own identifier
    pub aliases: BTreeMap<String, String>,
    pub poll: PollPolicy,
}

#[derive(Deserialize, Debug)]
struct RunResponse {
    outcome: i64,
    #[serde(default)]
    cmpinfo: String,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug)]
struct JobeRun {
    handle: SubmissionHandle,
    language: String,
    source: String,
    input: String,
    date: String,
    result: ResultCode,
    response: RunResponse,
}

/// Backend that runs programs on a remote job server over its REST API
///
/// The server answers a run synchronously, so submissions are done as soon
/// as they are created. Deferred runs (HTTP 202) are not supported and are
/// reported as server errors.
pub struct JobeSandbox {
    servers: Vec<String>,
    api_key: Option<String>,
    aliases: BTreeMap<String, String>,
    transport: Box<dyn HttpTransport>,
    languages: Option<BTreeSet<String>>,
    poll: PollPolicy,
    current: Option<JobeRun>,
    last_server: Option<String>,
}

impl JobeSandbox {
    /// Creates the backend and discovers the server's languages
    ///
    /// A failed discovery does not fail construction; the backend then
    /// rejects every call with [`SandboxError::UnknownServerError`].
    pub fn connect(options: JobeOptions, transport: Box<dyn HttpTransport>) -> Self {
        let servers = options
            .host
            .split(';')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", host.trim_end_matches('/'))
                }
            })
            .collect();

        let mut sandbox = Self {
            servers,
            api_key: options.api_key,
            aliases: options
                .aliases
                .into_iter()
                .map(|(name, id)| (name.to_lowercase(), id))
                .collect(),
            transport,
            languages: None,
            poll: options.poll,
            current: None,
            last_server: None,
        };
        sandbox.languages = sandbox.discover_languages();
        sandbox
    }

    fn discover_languages(&self) -> Option<BTreeSet<String>> {
        let job_id = rand::random::<u32>();
        let response = match self.request(job_id, HttpMethod::Get, "languages", None) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Language discovery failed: {e}");
                return None;
            }
        };
        if response.status != 200 {
            log::warn!("Language discovery returned HTTP {}", response.status);
            return None;
        }

        let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&response.body) else {
            log::warn!("Language discovery returned a non-list body");
            return None;
        };
        let offered: BTreeSet<String> = entries
            .iter()
            .filter_map(|entry| entry.get(0)?.as_str().map(str::to_lowercase))
            .collect();

        let mut languages = offered.clone();
        for (name, id) in &self.aliases {
            if offered.contains(&id.to_lowercase()) {
                languages.insert(name.clone());
            }
        }
        log::info!("Job server offers languages {languages:?}");
        Some(languages)
    }

    fn server_for(&self, job_id: u32) -> Option<&str> {
        if self.servers.is_empty() {
            return None;
        }
        let index = job_id as usize % self.servers.len();
        Some(&self.servers[index])
    }

    fn headers(&self, job_id: u32) -> Vec<(String, String)> {
        let mut headers = vec![
            ("User-Agent".to_string(), "CodeRunner".to_string()),
            (
                "Content-Type".to_string(),
                "application/json; charset=utf-8".to_string(),
            ),
            ("Accept".to_string(), "application/json".to_string()),
            ("X-CodeRunner-Job-Id".to_string(), format!("{job_id:08x}")),
        ];
        if let Some(key) = &self.api_key {
            headers.push(("X-API-KEY".to_string(), key.clone()));
        }
        headers
    }

    /// One HTTP call; all calls of a job go to the same server
    fn request(
        &self,
        job_id: u32,
        method: HttpMethod,
        resource: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, SandboxError> {
        let server = self
            .server_for(job_id)
            .ok_or_else(|| SandboxError::UnknownServerError("no job server configured".into()))?;
        let url = format!("{server}/{API_PATH}/{resource}");
        let body = body.map(Value::to_string);
        self.transport
            .send(method, &url, &self.headers(job_id), body.as_deref())
            .map_err(|e| SandboxError::UnknownServerError(format!("{e:#}")))
    }

    fn source_file_name(spec: &RunSpec, language: &str) -> String {
        if let Some(name) = &spec.params.source_file_name {
            return name.clone();
        }
        if language == "java" {
            return match main_class(&spec.source_code) {
                Some(class) => format!("{class}.java"),
                None => "prog.java".to_string(),
            };
        }
        format!("__tester__.{language}")
    }

    fn run_body(&self, spec: &RunSpec, language: &str) -> Result<Value, SandboxError> {
        let file_list: Vec<[String; 2]> = spec
            .files
            .iter()
            .map(|(name, contents)| [content_hash(contents), name.clone()])
            .collect();

        let mut run_spec = json!({
            "language_id": self.aliases.get(language).map(String::as_str).unwrap_or(language),
            "sourcecode": spec.source_code,
            "sourcefilename": Self::source_file_name(spec, language),
            "input": spec.normalized_stdin(),
            "file_list": file_list,
        });

        let mut parameters = match serde_json::to_value(&spec.params) {
            Ok(Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => return Err(SandboxError::Internal(e.to_string())),
        };
        parameters.remove("sourcefilename");
        parameters.remove("debug");
        if !parameters.is_empty() {
            run_spec["parameters"] = Value::Object(parameters);
        }
        if spec.params.debug {
            run_spec["debug"] = Value::Bool(true);
        }
        Ok(json!({ "run_spec": run_spec }))
    }

    /// Uploads every data file; the service answers 204 for each
    fn upload_files(&self, job_id: u32, spec: &RunSpec) -> Result<(), SandboxError> {
        for (name, contents) in &spec.files {
            let hash = content_hash(contents);
            log::info!("Uploading data file {name} as {hash}");
            let body = json!({ "file_contents": BASE64.encode(contents) });
            let response = self.request(job_id, HttpMethod::Put, &format!("files/{hash}"), Some(&body))?;
            if response.status != 204 {
                return Err(status_error(&response)
                    .unwrap_or_else(|| SandboxError::SubmissionFailed(format!("upload of {name} failed"))));
            }
        }
        Ok(())
    }

    fn submit(&self, job_id: u32, spec: &RunSpec, body: &Value) -> Result<HttpResponse, SandboxError> {
        let response = self.request(job_id, HttpMethod::Post, "runs", Some(body))?;
        if response.status != 404 || spec.files.is_empty() {
            return Ok(response);
        }

        // The server lacks one of the files; upload and try exactly once more
        self.upload_files(job_id, spec)?;
        let response = self.request(job_id, HttpMethod::Post, "runs", Some(body))?;
        if response.status == 404 {
            return Err(SandboxError::SubmissionFailed(
                "job server still missing data files after upload".into(),
            ));
        }
        Ok(response)
    }

    fn current(&self, handle: &SubmissionHandle) -> Result<&JobeRun, SandboxError> {
        self.current
            .as_ref()
            .filter(|run| &run.handle == handle)
            .ok_or(SandboxError::SubmissionNotFound)
    }
}

/// Hex SHA-256 of the file contents, independent of the file name
pub fn content_hash(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

/// Maps a non-success HTTP status onto a dispatch error
fn status_error(response: &HttpResponse) -> Option<SandboxError> {
    let err = match response.status {
        200 | 204 => return None,
        202 => SandboxError::UnknownServerError("deferred runs are not supported".into()),
        400 => SandboxError::BadRequest(response.body.clone()),
        401 => SandboxError::RateLimitExceeded,
        403 => SandboxError::AuthError,
        status => SandboxError::UnknownServerError(format!("HTTP {status}: {}", response.body)),
    };
    Some(err)
}

/// Removes the server's per-run working directory prefixes from output
pub fn strip_run_paths(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(RUN_TEMP_PREFIX) {
        let after = &rest[pos + RUN_TEMP_PREFIX.len()..];
        let id_len = after
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if id_len > 0 && after[id_len..].starts_with('/') {
            out.push_str(&rest[..pos]);
            rest = &after[id_len + 1..];
        } else {
            let keep = pos + RUN_TEMP_PREFIX.len();
            out.push_str(&rest[..keep]);
            rest = &rest[keep..];
        }
    }
    out.push_str(rest);
    out
}

impl Sandbox for JobeSandbox {
    fn name(&self) -> &str {
        "jobe"
    }

    fn languages(&self) -> Result<&BTreeSet<String>, SandboxError> {
        self.languages
            .as_ref()
            .ok_or_else(|| SandboxError::UnknownServerError("job server unavailable".into()))
    }

    fn create_submission(&mut self, spec: &RunSpec) -> Result<SubmissionHandle, SandboxError> {
        let language = spec.language_id();
        if !self.languages()?.contains(&language) {
            return Err(SandboxError::UnsupportedLanguage(language));
        }

        self.current = None;
        let job_id = rand::random::<u32>();
        let body = self.run_body(spec, &language)?;
        let response = self.submit(job_id, spec, &body)?;
        self.last_server = self.server_for(job_id).map(str::to_string);

        if response.status != 200 {
            log::warn!("Job server rejected run: HTTP {}", response.status);
            return Err(status_error(&response).unwrap_or_else(|| {
                SandboxError::UnknownServerError(format!("unexpected HTTP {}", response.status))
            }));
        }

        let mut response: RunResponse = serde_json::from_str(&response.body)
            .map_err(|e| SandboxError::UnknownServerError(format!("bad run response: {e}")))?;
        if response.outcome == OUTCOME_OVERLOAD {
            return Err(SandboxError::ServerOverload);
        }
        let mut result = ResultCode::from_code(response.outcome).ok_or_else(|| {
            SandboxError::UnknownServerError(format!("unknown outcome {}", response.outcome))
        })?;
        if result.is_success() && !response.stderr.trim().is_empty() {
            result = ResultCode::RuntimeError;
        }
        response.stdout = strip_run_paths(&response.stdout);
        response.stderr = strip_run_paths(&response.stderr);
        response.cmpinfo = strip_run_paths(&response.cmpinfo);

        let handle = SubmissionHandle::new(format!("{job_id:08x}"));
        self.current = Some(JobeRun {
            handle: handle.clone(),
            language,
            source: spec.source_code.clone(),
            input: spec.normalized_stdin(),
            date: Local::now().format("%Y-%m-%d %H-%M-%S").to_string(),
            result,
            response,
        });
        Ok(handle)
    }

    fn submission_status(
        &mut self,
        handle: &SubmissionHandle,
    ) -> Result<SubmissionStatus, SandboxError> {
        Ok(SubmissionStatus::done(self.current(handle)?.result))
    }

    fn submission_details(
        &mut self,
        handle: &SubmissionHandle,
        flags: DetailFlags,
    ) -> Result<SubmissionDetails, SandboxError> {
        let run = self.current(handle)?;
        Ok(SubmissionDetails {
            result: Some(run.result),
            language: run.language.clone(),
            date: run.date.clone(),
            source: flags.with_source.then(|| run.source.clone()),
            input: flags.with_input.then(|| run.input.clone()),
            stdout: flags.with_output.then(|| run.response.stdout.clone()),
            stderr: flags.with_stderr.then(|| run.response.stderr.clone()),
            compile_info: flags.with_compile_info.then(|| run.response.cmpinfo.clone()),
            ..Default::default()
        })
    }

    fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    fn sandbox_info(&self) -> Option<Value> {
        self.last_server
            .as_ref()
            .map(|server| json!({ "jobeserver": server }))
    }

    fn close(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone)]
    struct Call {
        method: HttpMethod,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<Value>,
    }

    /// Answers calls from a script and records what was asked
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        responses: Arc<Mutex<Vec<HttpResponse>>>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses)),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn send(
            &self,
            method: HttpMethod,
            url: &str,
            headers: &[(String, String)],
            body: Option<&str>,
        ) -> anyhow::Result<HttpResponse> {
            self.calls.lock().push(Call {
                method,
                url: url.to_string(),
                headers: headers.to_vec(),
                body: body.map(|body| serde_json::from_str(body).unwrap()),
            });
            let mut responses = self.responses.lock();
            anyhow::ensure!(!responses.is_empty(), "no scripted response left");
            Ok(responses.remove(0))
        }
    }

    fn languages_ok() -> HttpResponse {
        HttpResponse::new(200, r#"[["c", "gcc 9"], ["python3", "3.8"], ["java", "11"]]"#)
    }

    fn run_ok(stdout: &str) -> HttpResponse {
        HttpResponse::new(
            200,
            json!({"outcome": 15, "cmpinfo": "", "stdout": stdout, "stderr": ""}).to_string(),
        )
    }

    fn connect(transport: &ScriptedTransport) -> JobeSandbox {
        let options = JobeOptions {
            host: "jobe.example.com".to_string(),
            api_key: Some("secret".to_string()),
            ..Default::default()
        };
        JobeSandbox::connect(options, Box::new(transport.clone()))
    }

    fn header<'a>(call: &'a Call, name: &str) -> Option<&'a str> {
        call.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn test_languages_discovered_once() {
        let transport = ScriptedTransport::new(vec![languages_ok()]);
        let sandbox = connect(&transport);

        let first = sandbox.languages().unwrap().clone();
        let second = sandbox.languages().unwrap().clone();
        assert_eq!(first, second);
        assert!(first.contains("python3"));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(
            transport.calls()[0].url,
            "http://jobe.example.com/jobe/index.php/restapi/languages"
        );
    }

    #[test]
    fn test_unavailable_server_fails_fast() {
        let transport = ScriptedTransport::new(vec![HttpResponse::new(500, "oops")]);
        let mut sandbox = connect(&transport);

        assert!(matches!(
            sandbox.languages(),
            Err(SandboxError::UnknownServerError(_))
        ));
        let result = sandbox.execute(&RunSpec::new("print(1)", "python3"));
        assert!(matches!(result, Err(SandboxError::UnknownServerError(_))));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn test_non_list_language_body_is_unavailable() {
        let transport = ScriptedTransport::new(vec![HttpResponse::new(200, r#"{"c": "gcc"}"#)]);
        let sandbox = connect(&transport);
        assert!(sandbox.languages().is_err());
    }

    #[test]
    fn test_unsupported_language_never_contacts_server() {
        let transport = ScriptedTransport::new(vec![languages_ok()]);
        let mut sandbox = connect(&transport);

        let result = sandbox.create_submission(&RunSpec::new("x", "cobol"));
        assert_eq!(result, Err(SandboxError::UnsupportedLanguage("cobol".into())));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn test_run_request_layout() {
        let transport = ScriptedTransport::new(vec![languages_ok(), run_ok("2\n")]);
        let mut sandbox = connect(&transport);

        let spec = RunSpec::new("print(1+1)", "Python3").with_stdin("x");
        let result = sandbox.execute(&spec).unwrap();
        assert_eq!(result.result, ResultCode::Success);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(
            result.sandbox_info,
            Some(json!({"jobeserver": "http://jobe.example.com"}))
        );

        let call = &transport.calls()[1];
        assert_eq!(call.method, HttpMethod::Post);
        assert!(call.url.ends_with("/restapi/runs"));
        assert_eq!(header(call, "X-API-KEY"), Some("secret"));
        assert_eq!(header(call, "User-Agent"), Some("CodeRunner"));
        assert_eq!(header(call, "X-CodeRunner-Job-Id").map(str::len), Some(8));
        assert_eq!(
            call.body,
            Some(json!({"run_spec": {
                "language_id": "python3",
                "sourcecode": "print(1+1)",
                "sourcefilename": "__tester__.python3",
                "input": "x\n",
                "file_list": [],
            }}))
        );
    }

    #[test]
    fn test_missing_file_uploaded_then_resubmitted() {
        let transport = ScriptedTransport::new(vec![
            languages_ok(),
            HttpResponse::new(404, ""),
            HttpResponse::new(204, ""),
            run_ok("after upload\n"),
        ]);
        let mut sandbox = connect(&transport);

        let spec = RunSpec::new("int main(){}", "c").with_file("data.txt", b"hello".to_vec());
        let result = sandbox.execute(&spec).unwrap();
        assert_eq!(result.stdout, "after upload\n");

        let calls = transport.calls();
        let hash = content_hash(b"hello");
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2].method, HttpMethod::Put);
        assert!(calls[2].url.ends_with(&format!("/restapi/files/{hash}")));
        assert_eq!(calls[2].body, Some(json!({"file_contents": "aGVsbG8="})));
        assert_eq!(
            calls[1].body.as_ref().unwrap()["run_spec"]["file_list"],
            json!([[hash, "data.txt"]])
        );
    }

    #[test]
    fn test_second_missing_file_is_hard_failure() {
        let transport = ScriptedTransport::new(vec![
            languages_ok(),
            HttpResponse::new(404, ""),
            HttpResponse::new(204, ""),
            HttpResponse::new(404, ""),
        ]);
        let mut sandbox = connect(&transport);

        let spec = RunSpec::new("int main(){}", "c").with_file("data.txt", b"hello".to_vec());
        assert!(matches!(
            sandbox.execute(&spec),
            Err(SandboxError::SubmissionFailed(_))
        ));
        assert_eq!(transport.calls().len(), 4);
    }

    #[test]
    fn test_http_status_mapping() {
        let cases = [
            (400, SandboxError::BadRequest("bad".into())),
            (401, SandboxError::RateLimitExceeded),
            (403, SandboxError::AuthError),
        ];
        for (status, expected) in cases {
            let transport =
                ScriptedTransport::new(vec![languages_ok(), HttpResponse::new(status, "bad")]);
            let mut sandbox = connect(&transport);
            assert_eq!(sandbox.execute(&RunSpec::new("x", "c")), Err(expected));
        }

        let transport = ScriptedTransport::new(vec![languages_ok(), HttpResponse::new(202, "{}")]);
        let mut sandbox = connect(&transport);
        assert!(matches!(
            sandbox.execute(&RunSpec::new("x", "c")),
            Err(SandboxError::UnknownServerError(_))
        ));
    }

    #[test]
    fn test_overload_and_stderr_outcomes() {
        let overloaded = HttpResponse::new(200, r#"{"outcome": 21}"#);
        let transport = ScriptedTransport::new(vec![languages_ok(), overloaded]);
        let mut sandbox = connect(&transport);
        assert_eq!(
            sandbox.execute(&RunSpec::new("x", "c")),
            Err(SandboxError::ServerOverload)
        );

        let noisy = HttpResponse::new(
            200,
            json!({"outcome": 15, "stdout": "", "stderr": "Warning\n"}).to_string(),
        );
        let transport = ScriptedTransport::new(vec![languages_ok(), noisy]);
        let mut sandbox = connect(&transport);
        let result = sandbox.execute(&RunSpec::new("x", "c")).unwrap();
        assert_eq!(result.result, ResultCode::RuntimeError);
    }

    #[test]
    fn test_run_paths_are_stripped() {
        let text = "File \"/home/jobe/runs/jobe_Ab3_x/prog.py\", line 1\n";
        assert_eq!(strip_run_paths(text), "File \"prog.py\", line 1\n");
        assert_eq!(
            strip_run_paths("/home/jobe/runs/jobe_/x"),
            "/home/jobe/runs/jobe_/x"
        );
    }

    #[test]
    fn test_java_source_named_after_main_class() {
        let spec = RunSpec::new(
            "public class Greeter { public static void main(String[] a) {} }",
            "java",
        );
        assert_eq!(JobeSandbox::source_file_name(&spec, "java"), "Greeter.java");
        assert_eq!(
            JobeSandbox::source_file_name(&RunSpec::new("class X {}", "java"), "java"),
            "prog.java"
        );

        let subclass = RunSpec::new(
            "public class Main extends Base { static public void main(String[] a) {} }",
            "java",
        );
        assert_eq!(JobeSandbox::source_file_name(&subclass, "java"), "Main.java");
    }

    #[test]
    fn test_multiple_servers_share_one_job() {
        let transport = ScriptedTransport::new(vec![languages_ok(), run_ok("")]);
        let options = JobeOptions {
            host: "a.example.com; https://b.example.com/".to_string(),
            ..Default::default()
        };
        let mut sandbox = JobeSandbox::connect(options, Box::new(transport.clone()));
        sandbox.execute(&RunSpec::new("x", "c")).unwrap();

        let call = &transport.calls()[1];
        let job_id = u32::from_str_radix(header(call, "X-CodeRunner-Job-Id").unwrap(), 16).unwrap();
        let expected = ["http://a.example.com", "https://b.example.com"][job_id as usize % 2];
        assert!(call.url.starts_with(expected));
    }

    #[test]
    fn test_alias_maps_to_service_language() {
        let transport = ScriptedTransport::new(vec![languages_ok(), run_ok("")]);
        let options = JobeOptions {
            host: "jobe".to_string(),
            aliases: BTreeMap::from([("Python".to_string(), "python3".to_string())]),
            ..Default::default()
        };
        let mut sandbox = JobeSandbox::connect(options, Box::new(transport.clone()));
        assert!(sandbox.supports("python").unwrap());

        sandbox.execute(&RunSpec::new("x", "python")).unwrap();
        let body = transport.calls()[1].body.clone().unwrap();
        assert_eq!(body["run_spec"]["language_id"], json!("python3"));
    }
}
