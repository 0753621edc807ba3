//! `{{ placeholder }}` rendering for step commands, env values and
//! coverage file names.
//!
//! Supported placeholders:
//! - `{{ <axis> }}`: the job's value for a declared axis (empty if unbound)
//! - `{{ flag.<name> }}`: `1` if the flag is set, else `0`
//! - `{{ job.number }}`, `{{ job.key }}`, `{{ job.label }}`

use regex::Regex;
use std::sync::OnceLock;

use crate::axis::AxisSet;
use crate::error::ConfigError;
use crate::job::Job;

const JOB_FIELDS: &[&str] = &["number", "key", "label"];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Axis(String),
    Flag(String),
    Job(String),
}

impl Placeholder {
    fn parse(name: &str) -> Self {
        if let Some(flag) = name.strip_prefix("flag.") {
            Placeholder::Flag(flag.to_string())
        } else if let Some(field) = name.strip_prefix("job.") {
            Placeholder::Job(field.to_string())
        } else {
            Placeholder::Axis(name.to_string())
        }
    }
}

/// All placeholders referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    placeholder_re()
        .captures_iter(template)
        .map(|caps| Placeholder::parse(&caps[1]))
        .collect()
}

/// Check every placeholder in `template` refers to something that exists.
pub fn validate(template: &str, axes: &AxisSet, context: &str) -> Result<(), ConfigError> {
    for placeholder in placeholders(template) {
        match placeholder {
            Placeholder::Axis(axis) => {
                axes.require(&axis, context)?;
            }
            Placeholder::Flag(flag) if flag.is_empty() => {
                return Err(ConfigError::Template {
                    context: context.to_string(),
                    detail: "empty flag name".to_string(),
                });
            }
            Placeholder::Flag(_) => {}
            Placeholder::Job(field) if !JOB_FIELDS.contains(&field.as_str()) => {
                return Err(ConfigError::Template {
                    context: context.to_string(),
                    detail: format!(
                        "unknown job field '{field}' (expected one of {})",
                        JOB_FIELDS.join(", ")
                    ),
                });
            }
            Placeholder::Job(_) => {}
        }
    }
    Ok(())
}

/// Substitute placeholders with values from `job`.
pub fn render(template: &str, job: &Job) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match Placeholder::parse(&caps[1]) {
                Placeholder::Axis(axis) => job.spec.value(&axis).unwrap_or_default().to_string(),
                Placeholder::Flag(flag) => {
                    let set = job.spec.has_flag(&flag);
                    (if set { "1" } else { "0" }).to_string()
                }
                Placeholder::Job(field) => match field.as_str() {
                    "number" => job.number.to_string(),
                    "key" => job.key.to_string(),
                    "label" => job.label.clone(),
                    _ => String::new(),
                },
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;
    use crate::job::JobSpec;

    fn job() -> Job {
        let spec = JobSpec::new()
            .with_axis("os", "osx")
            .with_axis("python", "3.6")
            .with_flag("accel");
        Job::new(3, spec, &["os".to_string(), "python".to_string()])
    }

    #[test]
    fn test_render_axes_flags_and_job_fields() {
        let out = render(
            "pip install -r requirements-py{{python}}.txt # {{ os }} accel={{ flag.accel }} other={{flag.other}} n={{ job.number }}",
            &job(),
        );
        assert_eq!(
            out,
            "pip install -r requirements-py3.6.txt # osx accel=1 other=0 n=3"
        );
    }

    #[test]
    fn test_render_unbound_axis_is_empty() {
        let job = Job::new(1, JobSpec::new().with_axis("os", "linux"), &[]);
        assert_eq!(render("py={{ python }}", &job), "py=");
    }

    #[test]
    fn test_text_without_placeholders_untouched() {
        assert_eq!(
            render("echo ${HOME} {not a placeholder}", &job()),
            "echo ${HOME} {not a placeholder}"
        );
    }

    #[test]
    fn test_validate() {
        let axes = AxisSet::new(vec![Axis::new("os", ["linux", "osx"])]);
        assert!(validate("run-{{ os }}-{{ flag.x }}-{{ job.key }}", &axes, "step 'a'").is_ok());

        let err = validate("{{ python }}", &axes, "step 'a'").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAxis { .. }));

        let err = validate("{{ job.branch }}", &axes, "step 'a'").unwrap_err();
        assert!(matches!(err, ConfigError::Template { .. }));
    }

    #[test]
    fn test_placeholders_in_order() {
        assert_eq!(
            placeholders("{{ a }} {{flag.b}} {{ job.number }}"),
            vec![
                Placeholder::Axis("a".to_string()),
                Placeholder::Flag("b".to_string()),
                Placeholder::Job("number".to_string()),
            ]
        );
    }
}
