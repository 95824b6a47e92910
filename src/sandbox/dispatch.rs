use std::time::Duration;

use super::{
    GuardedRunner, JobeOptions, JobeSandbox, LocalSandbox, PollPolicy, ProcessRunner,
    ReqwestTransport, ResourceLimits, RunResult, RunSpec, Sandbox, SandboxError, VmRunner,
};
use crate::config::{Config, SandboxConfig};
use crate::language::LanguageKind;

const GUARDED_LANGUAGES: [LanguageKind; 4] = [
    LanguageKind::C,
    LanguageKind::Python2,
    LanguageKind::Python3,
    LanguageKind::Java,
];
const VM_LANGUAGES: [LanguageKind; 2] = [LanguageKind::Matlab, LanguageKind::Python2];

/// Hands out a fresh backend able to run a language
///
/// `slot` identifies the grading worker asking, so backends can keep
/// concurrent workers apart (for example by running them as different OS
/// users).
pub trait SandboxProvider: Send + Sync {
    fn sandbox_for(&self, language: &str, slot: usize) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Builds one backend instance from its configuration
pub fn create_sandbox(
    config: &SandboxConfig,
    defaults: &ResourceLimits,
    poll: PollPolicy,
    slot: usize,
) -> Result<Box<dyn Sandbox>, SandboxError> {
    let sandbox: Box<dyn Sandbox> = match config {
        SandboxConfig::Jobe(jobe) => {
            let transport = ReqwestTransport::new(Duration::from_secs(jobe.request_timeout_secs))?;
            let options = JobeOptions {
                host: jobe.host.clone(),
                api_key: jobe.api_key.clone(),
                aliases: jobe.aliases.clone(),
                poll,
            };
            Box::new(JobeSandbox::connect(options, Box::new(transport)))
        }
        SandboxConfig::Process(process) => {
            let limits = process.limits.unwrap_or(ResourceLimits {
                num_procs: 200,
                ..*defaults
            });
            let mut runner = ProcessRunner::new().with_defaults(limits);
            if !process.identities.is_empty() {
                runner = runner.with_identity(process.identities[slot % process.identities.len()]);
            }
            let mut sandbox = LocalSandbox::new(runner);
            if let Some(languages) = &process.languages {
                sandbox = sandbox.with_languages(languages.iter().copied());
            }
            if let Some(root) = &process.work_root {
                sandbox = sandbox.with_work_root(root);
            }
            for (language, program) in &process.interpreters {
                sandbox = sandbox.with_interpreter(*language, program);
            }
            Box::new(sandbox)
        }
        SandboxConfig::Guarded(guarded) => {
            let languages = guarded.languages.clone().unwrap_or(GUARDED_LANGUAGES.to_vec());
            let mut sandbox = LocalSandbox::new(GuardedRunner::new(&guarded.wrapper))
                .with_languages(languages)
                .with_limits(*defaults);
            if let Some(root) = &guarded.work_root {
                sandbox = sandbox.with_work_root(root);
            }
            Box::new(sandbox)
        }
        SandboxConfig::Vm(vm) => {
            let languages = vm.languages.clone().unwrap_or(VM_LANGUAGES.to_vec());
            let mut sandbox = LocalSandbox::new(VmRunner::new(&vm.bridge))
                .with_languages(languages)
                .with_limits(*defaults);
            if let Some(root) = &vm.work_root {
                sandbox = sandbox.with_work_root(root);
            }
            Box::new(sandbox)
        }
    };
    Ok(sandbox)
}

/// Picks the first enabled backend, in configured order, that runs a language
///
/// There is no load balancing and no fallback once a backend is chosen.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sandboxes: Vec<SandboxConfig>,
    defaults: ResourceLimits,
    poll: PollPolicy,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        Self::from_parts(
            config.sandboxes.clone(),
            config.defaults,
            config.poll.into(),
        )
    }

    /// Disabled entries in `sandboxes` are dropped here
    pub fn from_parts(sandboxes: Vec<SandboxConfig>, defaults: ResourceLimits, poll: PollPolicy) -> Self {
        let sandboxes = sandboxes
            .into_iter()
            .filter(SandboxConfig::enabled)
            .collect();
        Self {
            sandboxes,
            defaults,
            poll,
        }
    }

    /// Runs one program on the backend chosen for its language
    pub fn run(&self, spec: &RunSpec) -> Result<RunResult, SandboxError> {
        let mut sandbox = self.sandbox_for(&spec.language, 0)?;
        let result = sandbox.execute(spec);
        sandbox.close();
        result
    }
}

impl SandboxProvider for Dispatcher {
    fn sandbox_for(&self, language: &str, slot: usize) -> Result<Box<dyn Sandbox>, SandboxError> {
        let mut first_error = None;
        for config in &self.sandboxes {
            let sandbox = create_sandbox(config, &self.defaults, self.poll, slot)?;
            match sandbox.supports(language) {
                Ok(true) => {
                    log::debug!("Using {} sandbox for {language}", sandbox.name());
                    return Ok(sandbox);
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Skipping {} sandbox: {e}", sandbox.name());
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(match first_error {
            Some(SandboxError::UnknownServerError(msg)) => SandboxError::ServiceUnavailable(msg),
            Some(e) => e,
            None => SandboxError::NoSandboxForLanguage(language.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{GuardedConfig, JobeConfig, ProcessConfig};

    fn process(languages: Option<Vec<LanguageKind>>, enabled: bool) -> SandboxConfig {
        SandboxConfig::Process(ProcessConfig {
            enabled,
            languages,
            interpreters: Default::default(),
            limits: None,
            identities: Vec::new(),
            work_root: None,
        })
    }

    fn guarded(languages: Vec<LanguageKind>) -> SandboxConfig {
        SandboxConfig::Guarded(GuardedConfig {
            enabled: true,
            wrapper: PathBuf::from("/nonexistent/wrapper"),
            languages: Some(languages),
            work_root: None,
        })
    }

    fn dispatcher(sandboxes: Vec<SandboxConfig>) -> Dispatcher {
        Dispatcher::from_parts(sandboxes, ResourceLimits::default(), PollPolicy::default())
    }

    #[test]
    fn test_first_matching_backend_wins() {
        let dispatcher = dispatcher(vec![guarded(vec![LanguageKind::Shell]), process(None, true)]);

        assert_eq!(dispatcher.sandbox_for("SH", 0).unwrap().name(), "guarded");
        assert_eq!(dispatcher.sandbox_for("python3", 0).unwrap().name(), "process");
    }

    #[test]
    fn test_disabled_backends_are_ignored() {
        let dispatcher = dispatcher(vec![process(None, false)]);
        assert_eq!(
            dispatcher.sandbox_for("python3", 0).err(),
            Some(SandboxError::NoSandboxForLanguage("python3".into()))
        );
    }

    #[test]
    fn test_no_backend_for_language() {
        let dispatcher = dispatcher(vec![process(Some(vec![LanguageKind::C]), true)]);
        let err = dispatcher.sandbox_for("cobol", 0).err().unwrap();
        assert_eq!(err, SandboxError::NoSandboxForLanguage("cobol".into()));
        assert_eq!(err.to_string(), "No sandbox available for language cobol");
    }

    #[test]
    fn test_unreachable_job_server_reported_when_nothing_else_matches() {
        let jobe = SandboxConfig::Jobe(JobeConfig {
            enabled: true,
            host: "127.0.0.1:1".to_string(),
            api_key: None,
            aliases: Default::default(),
            request_timeout_secs: 2,
        });
        let dispatcher = dispatcher(vec![jobe, process(Some(vec![LanguageKind::Shell]), true)]);

        assert_eq!(dispatcher.sandbox_for("sh", 0).unwrap().name(), "process");
        assert!(matches!(
            dispatcher.sandbox_for("java", 0),
            Err(SandboxError::ServiceUnavailable(_))
        ));
    }
}
