use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::finder::Finder;

/// Whether a command runs once, or once per matched capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "shell")]
    Shell,
    #[default]
    #[serde(rename = "pcap", alias = "per-capture")]
    PerCapture,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Shell => f.write_str("shell"),
            CommandKind::PerCapture => f.write_str("pcap"),
        }
    }
}

/// One command of a job, as written in the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    pub name: String,

    /// Shell text, rendered as a template before running
    pub command: String,

    #[serde(rename = "type")]
    pub kind: CommandKind,

    /// Working directory template
    pub directory: Option<String>,

    /// Duration expression, defaults to the global command timeout
    pub timeout: Option<String>,

    /// Finder override for this command
    pub finder: Option<String>,

    /// Command-local template variables
    pub vars: BTreeMap<String, String>,
}

/// A job as written in the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub id: String,
    pub name: String,

    /// Finder id, `default` when empty
    pub finder: String,

    pub commands: Vec<CommandSpec>,
}

/// A validated command bound to its resolved finder
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub text: String,
    pub kind: CommandKind,
    pub directory: Option<String>,
    pub timeout: Duration,
    pub vars: BTreeMap<String, String>,
    pub finder: Arc<Finder>,
}

/// A validated job
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub finder: Arc<Finder>,
    pub commands: Vec<Command>,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Job {}]", self.id)
    }
}

fn per_capture(name: &str, command: &str, vars: &[(&str, &str)]) -> CommandSpec {
    CommandSpec {
        name: name.to_string(),
        command: command.to_string(),
        kind: CommandKind::PerCapture,
        vars: vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..CommandSpec::default()
    }
}

fn shell(name: &str, command: String) -> CommandSpec {
    CommandSpec {
        name: name.to_string(),
        command,
        kind: CommandKind::Shell,
        ..CommandSpec::default()
    }
}

fn job(id: &str, name: &str, commands: Vec<CommandSpec>) -> JobSpec {
    JobSpec {
        id: id.to_string(),
        name: name.to_string(),
        finder: "default".to_string(),
        commands,
    }
}

/// Quote `text` for a POSIX shell
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Jobs registered when the configuration defines none
pub fn builtin_jobs() -> Vec<JobSpec> {
    vec![
        job(
            "bro",
            "bro",
            vec![per_capture(
                "replay",
                "cd {{ finder_directory }} && {{ bro }} -r {{ relative_path }} -C {{ bro_config }}",
                &[
                    ("bro", "/usr/local/bro/bin/bro"),
                    ("bro_config", "/opt/bro-scripts/entrypoint.bro"),
                ],
            )],
        ),
        job(
            "zeek",
            "zeek",
            vec![per_capture(
                "replay",
                "cd {{ finder_directory }} && {{ zeek }} -r {{ relative_path }} -C {{ zeek_config }}",
                &[
                    ("zeek", "/opt/zeek/bin/zeek"),
                    ("zeek_config", "/opt/zeek-scripts/entrypoint.zeek"),
                ],
            )],
        ),
        job(
            "old-suricata",
            "suricata (legacy install)",
            vec![per_capture(
                "replay",
                "cd {{ finder_directory }} && {{ suricata }} -c {{ suricata_config }} -r {{ relative_path }} -k none --runmode autofp",
                &[
                    ("suricata", "/usr/local/suricata/bin/suricata"),
                    ("suricata_config", "/usr/local/suricata/etc/suricata/suricata.yaml"),
                ],
            )],
        ),
        job(
            "new-suricata",
            "suricata",
            vec![per_capture(
                "replay",
                "cd {{ finder_directory }} && {{ suricata }} -c {{ suricata_config }} -r {{ relative_path }} -k none --runmode autofp",
                &[
                    ("suricata", "/opt/suricata/bin/suricata"),
                    ("suricata_config", "/opt/suricata/etc/suricata/suricata.yaml"),
                ],
            )],
        ),
        job(
            "moloch",
            "moloch",
            vec![per_capture(
                "replay",
                "cd {{ finder_directory }} && {{ moloch }} --insecure -c {{ moloch_config }} -r {{ relative_path }}",
                &[
                    ("moloch", "/data/moloch/bin/moloch-capture"),
                    ("moloch_config", "/data/moloch/etc/config.ini"),
                ],
            )],
        ),
    ]
}

/// Copy every generated capture under `directory`, keeping relative layout
pub fn fast_copy_job(directory: &Path) -> JobSpec {
    let dir = shell_quote(&directory.to_string_lossy());
    job(
        "fast-copy",
        "copy generated captures",
        vec![
            shell("prepare", format!("mkdir -p {}", dir)),
            per_capture(
                "copy",
                &format!(
                    "cd {} && mkdir -p {{{{ relative_directory }}}} && cp -f {{{{ path }}}} {{{{ relative_directory }}}}/",
                    dir
                ),
                &[],
            ),
        ],
    )
}

/// Merge every generated capture into the single file `output`, staging
/// copies in `staging` which is removed afterwards
pub fn fast_merge_job(output: &Path, staging: &Path) -> JobSpec {
    let out = shell_quote(&output.to_string_lossy());
    let tmp = shell_quote(&staging.to_string_lossy());
    job(
        "fast-merge",
        "merge generated captures",
        vec![
            shell("prepare", format!("mkdir -p {}", tmp)),
            per_capture(
                "copy",
                &format!(
                    "cd {} && mkdir -p {{{{ relative_directory }}}} && cp -f {{{{ path }}}} {{{{ relative_directory }}}}/",
                    tmp
                ),
                &[],
            ),
            shell(
                "merge",
                format!("find {} -type f | xargs {{{{ mergecap }}}} -w {}", tmp, out),
            ),
            shell("clean", format!("rm -rf {}", tmp)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            commands: Vec<CommandSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[commands]]
            name = "a"
            command = "true"
            type = "shell"

            [[commands]]
            name = "b"
            command = "true"

            [[commands]]
            name = "c"
            command = "true"
            type = "per-capture"
            "#,
        )
        .unwrap();
        let kinds: Vec<_> = parsed.commands.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CommandKind::Shell, CommandKind::PerCapture, CommandKind::PerCapture]
        );
    }

    #[test]
    fn builtin_and_fast_jobs() {
        let ids: Vec<_> = builtin_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, ["bro", "zeek", "old-suricata", "new-suricata", "moloch"]);

        let copy = fast_copy_job(Path::new("/out dir"));
        assert_eq!(copy.commands[0].command, "mkdir -p '/out dir'");
        assert_eq!(
            copy.commands[1].command,
            "cd '/out dir' && mkdir -p {{ relative_directory }} && cp -f {{ path }} {{ relative_directory }}/"
        );

        let merge = fast_merge_job(Path::new("/out/all.pcap"), Path::new("/tmp/m"));
        let kinds: Vec<_> = merge.commands.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::Shell,
                CommandKind::PerCapture,
                CommandKind::Shell,
                CommandKind::Shell
            ]
        );
        assert_eq!(
            merge.commands[2].command,
            "find '/tmp/m' -type f | xargs {{ mergecap }} -w '/out/all.pcap'"
        );
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
