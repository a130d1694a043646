pub mod builtin;

pub use builtin::{descriptor, descriptors};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{AssayConfig, SkillConfig};
use crate::execution::{CommandSpec, last_nonempty_line};
use crate::models::{CoreError, CoreErrorKind, Experiment};

pub type SkillResult<T> = Result<T, CoreError>;

/// Fields every skill must report on its final stdout line.
pub const REQUIRED_RESULT_FIELDS: &[&str] = &["experiment_id", "status"];
/// Environment variable carrying the experiment id into the skill process.
pub const EXPERIMENT_ID_ENV: &str = "ASSAY_EXPERIMENT_ID";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SkillDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub stage: &'static str,
    pub executable: &'static str,
    /// Flags that take one value, as `--flag value` or `--flag=value`.
    pub value_flags: &'static [&'static str],
    pub switch_flags: &'static [&'static str],
    /// Value flags whose value names a file the skill must produce.
    pub output_flags: &'static [&'static str],
    pub expected_fields: &'static [&'static str],
    pub default_timeout: Duration,
}

/// Fully resolved subprocess call for one skill run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkillInvocation {
    pub command: CommandSpec,
    pub declared_outputs: Vec<PathBuf>,
    pub timeout: Duration,
}

pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &'static SkillDescriptor;

    fn timeout(&self) -> Duration;

    fn executable(&self) -> &Path;

    fn invocation(&self, experiment: &Experiment, args: &[String]) -> SkillResult<SkillInvocation>;

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    fn stage(&self) -> &'static str {
        self.descriptor().stage
    }

    fn parse_result(&self, stdout: &[u8]) -> SkillResult<BTreeMap<String, Value>> {
        parse_result_line(self.descriptor(), stdout)
    }
}

/// A built-in skill run as an external executable.
#[derive(Clone, Debug)]
pub struct ScriptSkill {
    descriptor: &'static SkillDescriptor,
    executable: PathBuf,
    timeout: Duration,
    env: BTreeMap<String, String>,
}

impl ScriptSkill {
    pub fn new(descriptor: &'static SkillDescriptor) -> Self {
        Self {
            descriptor,
            executable: PathBuf::from(descriptor.executable),
            timeout: descriptor.default_timeout,
            env: BTreeMap::new(),
        }
    }

    pub fn configure(mut self, config: &SkillConfig) -> Self {
        if let Some(executable) = &config.executable {
            self.executable = executable.clone();
        }
        if let Some(timeout_secs) = config.timeout_secs {
            self.timeout = Duration::from_secs(timeout_secs);
        }
        self.env.extend(
            config
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        self
    }

    fn parse_args(&self, location: &Path, args: &[String]) -> SkillResult<(Vec<String>, Vec<PathBuf>)> {
        let descriptor = self.descriptor;
        let mut rendered = Vec::new();
        let mut outputs = Vec::new();
        let mut remaining = args.iter();

        while let Some(arg) = remaining.next() {
            let (flag, inline_value) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
                _ => (arg.as_str(), None),
            };

            if !flag.starts_with("--") {
                return Err(self.invalid(format!(
                    "unexpected positional argument '{arg}'; the data path is supplied by the registry"
                )));
            }

            if descriptor.switch_flags.contains(&flag) {
                if inline_value.is_some() {
                    return Err(self.invalid(format!("flag '{flag}' does not take a value")));
                }
                rendered.push(flag.to_string());
                continue;
            }

            if !descriptor.value_flags.contains(&flag) {
                return Err(self.invalid(format!(
                    "flag '{flag}' is not accepted by skill '{}'",
                    descriptor.name
                )));
            }

            let value = match inline_value {
                Some(value) => value,
                None => remaining
                    .next()
                    .cloned()
                    .ok_or_else(|| self.invalid(format!("flag '{flag}' requires a value")))?,
            };
            if value.trim().is_empty() {
                return Err(self.invalid(format!("flag '{flag}' requires a non-empty value")));
            }

            let value = if descriptor.output_flags.contains(&flag) {
                let path = resolve_output(location, &value);
                let rendered_path = path.to_string_lossy().to_string();
                outputs.push(path);
                rendered_path
            } else {
                value
            };
            rendered.push(flag.to_string());
            rendered.push(value);
        }

        Ok((rendered, outputs))
    }

    fn invalid(&self, message: String) -> CoreError {
        CoreError::new(CoreErrorKind::ValidationError, message).skill(self.descriptor.name)
    }
}

impl Skill for ScriptSkill {
    fn descriptor(&self) -> &'static SkillDescriptor {
        self.descriptor
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn executable(&self) -> &Path {
        &self.executable
    }

    fn invocation(&self, experiment: &Experiment, args: &[String]) -> SkillResult<SkillInvocation> {
        let location = Path::new(&experiment.location);
        let (flags, declared_outputs) = self
            .parse_args(location, args)
            .map_err(|error| error.experiment(&experiment.id))?;

        let mut command = CommandSpec::new(&self.executable)
            .arg(experiment.location.clone())
            .args(flags)
            .env(EXPERIMENT_ID_ENV, experiment.id.as_str());
        for (key, value) in &self.env {
            command = command.env(key.clone(), value.clone());
        }

        Ok(SkillInvocation {
            command,
            declared_outputs,
            timeout: self.timeout,
        })
    }
}

/// The built-in skills, with config overrides applied.
#[derive(Clone)]
pub struct SkillSet {
    skills: BTreeMap<&'static str, Arc<dyn Skill>>,
}

impl SkillSet {
    pub fn builtin() -> Self {
        let skills = descriptors()
            .iter()
            .map(|descriptor| {
                (
                    descriptor.name,
                    Arc::new(ScriptSkill::new(descriptor)) as Arc<dyn Skill>,
                )
            })
            .collect();
        Self { skills }
    }

    pub fn from_config(config: &AssayConfig) -> SkillResult<Self> {
        config.validate()?;
        let mut skills = BTreeMap::new();
        for descriptor in descriptors() {
            let mut skill = ScriptSkill::new(descriptor);
            if let Some(timeout_secs) = config.default_timeout_secs {
                skill.timeout = Duration::from_secs(timeout_secs);
            }
            if let Some(overrides) = config.skills.get(descriptor.name) {
                skill = skill.configure(overrides);
            }
            skills.insert(descriptor.name, Arc::new(skill) as Arc<dyn Skill>);
        }
        Ok(Self { skills })
    }

    /// Applies `config` to the built-in skill `name`.
    pub fn configure(mut self, name: &str, config: &SkillConfig) -> SkillResult<Self> {
        let descriptor = descriptor(name).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::ConfigError,
                format!("cannot configure unknown skill '{name}'"),
            )
            .skill(name)
        })?;
        let skill = ScriptSkill::new(descriptor).configure(config);
        self.skills.insert(descriptor.name, Arc::new(skill));
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> SkillResult<Arc<dyn Skill>> {
        self.skills.get(name).cloned().ok_or_else(|| {
            let known: Vec<_> = self.skills.keys().copied().collect();
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("unknown skill '{name}' (known: {})", known.join(", ")),
            )
            .skill(name)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Skill>> {
        self.skills.values()
    }
}

impl Default for SkillSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parses the last non-empty stdout line as the skill's JSON result object.
pub fn parse_result_line(
    descriptor: &SkillDescriptor,
    stdout: &[u8],
) -> SkillResult<BTreeMap<String, Value>> {
    let parse_failure = |message: String| {
        CoreError::new(CoreErrorKind::ParseFailure, message).skill(descriptor.name)
    };

    let line = last_nonempty_line(stdout)
        .ok_or_else(|| parse_failure("skill produced no output".to_string()))?;
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|error| parse_failure(format!("last output line is not JSON: {error}")))?;
    let Value::Object(fields) = value else {
        return Err(parse_failure(
            "last output line is not a JSON object".to_string(),
        ));
    };

    let missing: Vec<&str> = REQUIRED_RESULT_FIELDS
        .iter()
        .chain(descriptor.expected_fields)
        .copied()
        .filter(|field| !fields.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(parse_failure(format!(
            "result is missing required field(s): {}",
            missing.join(", ")
        )));
    }

    Ok(fields.into_iter().collect())
}

fn resolve_output(location: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        location.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    use super::{SkillSet, descriptor, parse_result_line};
    use crate::config::SkillConfig;
    use crate::models::{CoreErrorKind, Experiment, ExperimentId, ExperimentStatus};

    fn experiment() -> Experiment {
        Experiment {
            id: ExperimentId::new("exp-run7"),
            name: "run7".to_string(),
            location: "/data/run7".to_string(),
            status: ExperimentStatus::Registered,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at_ms: 0,
            events: Vec::new(),
        }
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn invocation_puts_data_path_first_and_resolves_outputs() {
        let skill = SkillSet::builtin().resolve("qc").unwrap();
        let invocation = skill
            .invocation(
                &experiment(),
                &args(&["--json", "qc.json", "--threads=4", "--force"]),
            )
            .unwrap();

        assert_eq!(invocation.command.program, PathBuf::from("assay-qc"));
        assert_eq!(
            invocation.command.args,
            args(&["/data/run7", "--json", "/data/run7/qc.json", "--threads", "4", "--force"])
        );
        assert_eq!(
            invocation.declared_outputs,
            vec![PathBuf::from("/data/run7/qc.json")]
        );
        assert_eq!(invocation.command.env["ASSAY_EXPERIMENT_ID"], "exp-run7");
    }

    #[test]
    fn flags_outside_the_allowed_set_are_rejected() {
        let skill = SkillSet::builtin().resolve("align").unwrap();
        let error = skill
            .invocation(&experiment(), &args(&["--rm-rf", "/"]))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ValidationError);

        let error = skill
            .invocation(&experiment(), &args(&["extra.bam"]))
            .unwrap_err();
        assert!(error.message.contains("positional"));

        let error = skill
            .invocation(&experiment(), &args(&["--reference"]))
            .unwrap_err();
        assert!(error.message.contains("requires a value"));
    }

    #[test]
    fn unknown_skill_is_not_found() {
        let error = SkillSet::builtin().resolve("variant_call").err().unwrap();
        assert_eq!(error.kind, CoreErrorKind::NotFound);
        assert_eq!(error.skill.as_deref(), Some("variant_call"));
    }

    #[test]
    fn overrides_replace_executable_and_timeout() {
        let skills = SkillSet::builtin()
            .configure(
                "qc",
                &SkillConfig {
                    executable: Some(PathBuf::from("/opt/qc.sh")),
                    timeout_secs: Some(30),
                    env: BTreeMap::new(),
                },
            )
            .unwrap();
        let qc = skills.resolve("qc").unwrap();
        assert_eq!(qc.executable(), PathBuf::from("/opt/qc.sh").as_path());
        assert_eq!(qc.timeout().as_secs(), 30);

        assert!(
            SkillSet::builtin()
                .configure("variant_call", &SkillConfig::default())
                .is_err()
        );
    }

    #[test]
    fn result_line_requires_contract_fields() {
        let qc = descriptor("qc").unwrap();
        let stdout = b"progress 50%\n{\"experiment_id\":\"exp-run7\",\"status\":\"ok\",\"reads\":1200}\n\n";
        let fields = parse_result_line(qc, stdout).unwrap();
        assert_eq!(fields["reads"], 1200);

        let error = parse_result_line(qc, b"{\"experiment_id\":\"exp-run7\",\"status\":\"ok\"}\n")
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ParseFailure);
        assert!(error.message.contains("reads"));

        let error = parse_result_line(qc, b"done\n").unwrap_err();
        assert!(error.message.contains("not JSON"));
    }
}
