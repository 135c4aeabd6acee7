//! Resolution of the configured modifiers, finders and jobs into the
//! validated objects the rest of the run works with.

use log::{debug, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::finder::Finder;
use crate::models::check_id;
use crate::models::config::{FileConfig, RunSettings};
use crate::models::filter::FinderSpec;
use crate::models::job::{builtin_jobs, fast_copy_job, fast_merge_job, Command, Job, JobSpec};
use crate::models::modifier::{Modifier, ModifierSpec};
use crate::utils::duration::parse_duration;
use crate::utils::error::{AppError, AppResult};

const DEFAULT_ID: &str = "default";

/// Every resolved object of one run, keyed by id
#[derive(Debug, Default)]
pub struct Catalog {
    pub modifiers: BTreeMap<String, Arc<Modifier>>,
    pub finders: BTreeMap<String, Arc<Finder>>,
    pub jobs: Vec<Arc<Job>>,
}

fn config_error(msg: String) -> AppError {
    AppError::ConfigError(msg)
}

/// Prefix configuration errors with the object they were found in
fn labelled(label: &str, e: AppError) -> AppError {
    match e {
        AppError::ConfigError(msg) => AppError::ConfigError(format!("{} {}", label, msg)),
        other => other,
    }
}

/// Fall back to `default` for an empty reference
fn reference(id: &str) -> &str {
    let id = id.trim();
    if id.is_empty() {
        DEFAULT_ID
    } else {
        id
    }
}

impl Catalog {
    /// Validate the whole configuration.
    ///
    /// User finders are checked eagerly. The `default` finder is only built
    /// when something refers to it, so a missing default directory matters
    /// only if it is used.
    pub fn resolve(file: &FileConfig, settings: &RunSettings) -> AppResult<Self> {
        let mut catalog = Catalog::default();
        catalog.resolve_modifiers(&file.config.modifier, &file.modifiers)?;

        let mut finder_specs: BTreeMap<String, &FinderSpec> = BTreeMap::new();
        finder_specs.insert(DEFAULT_ID.to_string(), &file.config.finder);
        for spec in &file.finders {
            check_id(&spec.id).map_err(|e| labelled(&format!("[Finder {}]", spec.id), e))?;
            if finder_specs.insert(spec.id.clone(), spec).is_some() {
                return Err(config_error(format!("duplicate finder id `{}`", spec.id)));
            }
            catalog.finder(&finder_specs, &spec.id, settings)?;
        }

        let job_specs = job_specs(file, settings)?;
        let fast = settings.fast_copy.is_some() || settings.fast_merge.is_some();
        let mut seen = BTreeMap::new();
        for spec in &job_specs {
            check_id(&spec.id).map_err(|e| labelled(&format!("[Job {}]", spec.id), e))?;
            if seen.insert(spec.id.clone(), ()).is_some() {
                return Err(config_error(format!("duplicate job id `{}`", spec.id)));
            }
            let enabled = fast || settings.selects(&spec.id);
            let job = catalog.job(spec, enabled, &finder_specs, settings)?;
            if job.enabled {
                job.finder.mark_used();
                for command in &job.commands {
                    command.finder.mark_used();
                }
            }
            catalog.jobs.push(Arc::new(job));
        }

        debug!(
            "resolved {} modifiers, {} finders, {} jobs",
            catalog.modifiers.len(),
            catalog.finders.len(),
            catalog.jobs.len()
        );
        Ok(catalog)
    }

    fn resolve_modifiers(
        &mut self,
        default: &ModifierSpec,
        specs: &[ModifierSpec],
    ) -> AppResult<()> {
        let default = ModifierSpec {
            id: DEFAULT_ID.to_string(),
            ..default.clone()
        };
        self.modifiers
            .insert(DEFAULT_ID.to_string(), Arc::new(Modifier::from_spec(&default)?));

        for spec in specs {
            check_id(&spec.id).map_err(|e| labelled(&format!("[Modifier {}]", spec.id), e))?;
            if self.modifiers.contains_key(&spec.id) {
                return Err(config_error(format!("duplicate modifier id `{}`", spec.id)));
            }
            self.modifiers
                .insert(spec.id.clone(), Arc::new(Modifier::from_spec(spec)?));
        }
        Ok(())
    }

    /// Look up a finder, building it on first reference
    fn finder(
        &mut self,
        specs: &BTreeMap<String, &FinderSpec>,
        id: &str,
        settings: &RunSettings,
    ) -> AppResult<Arc<Finder>> {
        if let Some(finder) = self.finders.get(id) {
            return Ok(Arc::clone(finder));
        }
        let spec = specs
            .get(id)
            .ok_or_else(|| config_error(format!("finder `{}` is not defined", id)))?;
        let modifier_id = reference(&spec.modifier);
        let modifier = self.modifiers.get(modifier_id).cloned().ok_or_else(|| {
            config_error(format!(
                "[Finder {}] modifier `{}` is not defined",
                id, modifier_id
            ))
        })?;
        let finder = Arc::new(Finder::from_spec(
            spec,
            modifier,
            &settings.working_directory,
        )?);
        self.finders.insert(id.to_string(), Arc::clone(&finder));
        Ok(finder)
    }

    fn job(
        &mut self,
        spec: &JobSpec,
        enabled: bool,
        finders: &BTreeMap<String, &FinderSpec>,
        settings: &RunSettings,
    ) -> AppResult<Job> {
        let label = format!("[Job {}]", spec.id);
        let finder = self
            .finder(finders, reference(&spec.finder), settings)
            .map_err(|e| labelled(&label, e))?;
        if spec.commands.is_empty() {
            return Err(config_error(format!("{} has no commands", label)));
        }

        let mut commands = Vec::with_capacity(spec.commands.len());
        for (idx, command) in spec.commands.iter().enumerate() {
            let name = match command.name.trim() {
                "" => format!("#{}", idx),
                name => name.to_string(),
            };
            let prefix = format!("{} [Command {}]", label, name);
            if command.command.trim().is_empty() {
                return Err(config_error(format!("{} command text is empty", prefix)));
            }

            let timeout = match command.timeout.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => parse_duration(text)
                    .map_err(|e| config_error(format!("{} timeout: {}", prefix, e)))?,
                _ => Duration::ZERO,
            };
            let timeout = if timeout.is_zero() {
                settings.command_timeout
            } else {
                timeout
            };

            let command_finder = match command.finder.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => self
                    .finder(finders, id, settings)
                    .map_err(|e| labelled(&prefix, e))?,
                _ => Arc::clone(&finder),
            };

            commands.push(Command {
                name,
                text: command.command.clone(),
                kind: command.kind,
                directory: command.directory.clone().filter(|d| !d.trim().is_empty()),
                timeout,
                vars: command.vars.clone(),
                finder: command_finder,
            });
        }

        Ok(Job {
            id: spec.id.clone(),
            name: match spec.name.trim() {
                "" => spec.id.clone(),
                name => name.to_string(),
            },
            enabled,
            finder,
            commands,
        })
    }

    pub fn enabled_jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.iter().filter(|j| j.enabled).cloned().collect()
    }

    /// Finders referenced by at least one enabled job
    pub fn used_finders(&self) -> Vec<Arc<Finder>> {
        self.finders
            .values()
            .filter(|f| f.is_used())
            .cloned()
            .collect()
    }

    /// JSON view of the resolved configuration, for `--debug`
    pub fn describe(&self) -> serde_json::Value {
        let finders: Vec<_> = self
            .finders
            .values()
            .map(|f| {
                json!({
                    "id": f.id,
                    "directory": f.root,
                    "modifier": f.modifier.id,
                    "used": f.is_used(),
                    "tags": f.rules.tag_combos,
                    "patterns": f.rules.patterns.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                    "pps": f.rules.pps,
                    "packet_count": f.rules.packet_count,
                    "avg_packet_size": f.rules.avg_packet_size,
                    "only_ipv6": f.rules.only_ipv6,
                    "only_ethernet": f.rules.only_ethernet,
                    "read_filter": f.read_filter,
                })
            })
            .collect();
        let jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|j| {
                json!({
                    "id": j.id,
                    "name": j.name,
                    "enabled": j.enabled,
                    "finder": j.finder.id,
                    "commands": j.commands.iter().map(|c| json!({
                        "name": c.name,
                        "type": c.kind.to_string(),
                        "command": c.text,
                        "directory": c.directory,
                        "timeout": crate::utils::duration::format_duration(c.timeout),
                        "finder": c.finder.id,
                        "vars": c.vars,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({
            "modifiers": self.modifiers.values().map(|m| m.as_ref()).collect::<Vec<_>>(),
            "finders": finders,
            "jobs": jobs,
        })
    }
}

/// Jobs to register: a fast job, the configured jobs, or the builtins
fn job_specs(file: &FileConfig, settings: &RunSettings) -> AppResult<Vec<JobSpec>> {
    if let Some(directory) = &settings.fast_copy {
        info!("fast copy into {}", directory.display());
        return Ok(vec![fast_copy_job(directory)]);
    }
    if let Some(output) = &settings.fast_merge {
        // created by the job itself, removed with the run directory
        let staging = settings.working_directory.join("fast-merge");
        info!(
            "fast merge into {} through {}",
            output.display(),
            staging.display()
        );
        return Ok(vec![fast_merge_job(output, &staging)]);
    }
    if file.jobs.is_empty() {
        return Ok(builtin_jobs());
    }
    Ok(file.jobs.clone())
}
