//! Built-in stage producers used by the `floe` binary.

use std::collections::{BTreeMap, BTreeSet};

use floe_common::StageContext;
use floe_manifest::{EffectivePolicy, ResolvedManifest};

use crate::error::ProducerError;
use crate::producer::{
    EnforcementResult, EnvSnapshot, MacroNode, ModelNode, PolicyEnforcer, Profile,
    ProfileResolver, ProjectManifest, ProjectParser, SecretRef, Violation, SECRET_PREFIX,
};
use crate::sources::{ProjectSources, SourceFile};

/// Selects the deployment target.
pub const TARGET_VAR: &str = "FLOE_TARGET";

/// Variables with this prefix become plain profile settings.
pub const SETTING_PREFIX: &str = "FLOE_PROFILE_";

/// Builds profiles from `FLOE_*` environment variables.
///
/// - `FLOE_TARGET` selects the target (default `dev`).
/// - `FLOE_PROFILE_<KEY>` becomes setting `<key>`.
/// - `FLOE_SECRET_<KEY>` becomes secret `<key>` = `env:FLOE_SECRET_<KEY>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProfileResolver;

impl ProfileResolver for EnvProfileResolver {
    fn resolve_profile(
        &self,
        resolved: &ResolvedManifest,
        env: &EnvSnapshot,
        ctx: &StageContext,
    ) -> Result<Profile, ProducerError> {
        ctx.checkpoint()?;
        let mut settings = BTreeMap::new();
        let mut secrets = BTreeMap::new();
        for (name, value) in env.iter() {
            if let Some(key) = name.strip_prefix(SETTING_PREFIX) {
                settings.insert(key.to_ascii_lowercase(), value.to_string());
            } else if let Some(key) = name.strip_prefix(SECRET_PREFIX) {
                secrets.insert(key.to_ascii_lowercase(), SecretRef::env(name));
            }
        }
        Ok(Profile {
            name: resolved.product.clone(),
            target: env.get(TARGET_VAR).unwrap_or("dev").to_string(),
            adapter: resolved.plugins.get("compute").cloned(),
            settings,
            secrets,
        })
    }
}

/// Parses a directory of SQL models and macros.
///
/// Model names are file stems; dependencies are the `ref('...')` calls in the
/// model body. Macro names come from `{% macro name(` blocks. Jinja `{# #}`,
/// SQL `/* */`, and SQL `--` comments are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryProjectParser;

impl ProjectParser for DirectoryProjectParser {
    fn parse(
        &self,
        sources: &ProjectSources,
        profile: &Profile,
        ctx: &StageContext,
    ) -> Result<ProjectManifest, ProducerError> {
        let mut models = Vec::with_capacity(sources.models.len());
        let mut names = BTreeSet::new();
        for file in &sources.models {
            ctx.checkpoint()?;
            let name = file.stem().to_string();
            if !names.insert(name.clone()) {
                return Err(ProducerError::failed(format!(
                    "duplicate model name '{name}' ({})",
                    file.path
                )));
            }
            models.push(ModelNode {
                name,
                path: file.path.clone(),
                depends_on: find_calls(&strip_comments(&file.content), "ref"),
                checksum: file.digest,
            });
        }

        for model in &models {
            if let Some(missing) = model.depends_on.iter().find(|d| !names.contains(*d)) {
                return Err(ProducerError::failed(format!(
                    "model '{}' references unknown model '{missing}'",
                    model.name
                )));
            }
        }

        let mut macros: Vec<MacroNode> = sources.macros.iter().flat_map(macro_nodes).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        macros.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ProjectManifest {
            name: profile.name.clone(),
            target: profile.target.clone(),
            models,
            macros,
        })
    }
}

/// Arguments of every `func('arg')` / `func("arg")` call, sorted and deduplicated.
fn find_calls(body: &str, func: &str) -> Vec<String> {
    let needle = format!("{func}(");
    let mut found = BTreeSet::new();
    let mut rest = body;
    while let Some(pos) = rest.find(&needle) {
        let preceded_by_ident = rest[..pos]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        rest = &rest[pos + needle.len()..];
        if preceded_by_ident {
            continue;
        }
        let args = rest.trim_start();
        let Some(quote) = args.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            continue;
        };
        if let Some(end) = args[1..].find(quote) {
            found.insert(args[1..1 + end].to_string());
        }
    }
    found.into_iter().collect()
}

/// Removes Jinja, SQL block, and SQL line comments. Line breaks are kept.
fn strip_comments(body: &str) -> String {
    const COMMENTS: [(&str, &str); 3] = [("{#", "#}"), ("/*", "*/"), ("--", "\n")];
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    loop {
        let next = COMMENTS
            .iter()
            .filter_map(|(open, close)| rest.find(open).map(|pos| (pos, *open, *close)))
            .min_by_key(|(pos, _, _)| *pos);
        let Some((pos, open, close)) = next else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..pos]);
        let inside = &rest[pos + open.len()..];
        let Some(end) = inside.find(close) else {
            return out;
        };
        rest = if close == "\n" {
            &inside[end..]
        } else {
            &inside[end + close.len()..]
        };
    }
}

/// Names declared by `{% macro name(...) %}` tags outside comments.
fn macro_nodes(file: &SourceFile) -> Vec<MacroNode> {
    let body = strip_comments(&file.content);
    let mut nodes = Vec::new();
    let mut rest = body.as_str();
    while let Some(pos) = rest.find("{%") {
        rest = &rest[pos + 2..];
        let tag = rest.strip_prefix('-').unwrap_or(rest).trim_start();
        let Some(decl) = tag.strip_prefix("macro") else {
            continue;
        };
        if !decl.starts_with(char::is_whitespace) {
            continue;
        }
        let name: String = decl
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            nodes.push(MacroNode {
                name,
                path: file.path.clone(),
            });
        }
    }
    nodes
}

/// Enforces the governance policies the core understands.
///
/// - `naming_convention = "snake_case"`: every model name is snake_case.
/// - `max_models = <n>`: the project has at most `n` models.
///
/// Other policies are passed through unchecked.
#[derive(Debug, Clone, Copy, Default)]
pub struct GovernanceEnforcer;

impl PolicyEnforcer for GovernanceEnforcer {
    fn enforce(
        &self,
        project: &ProjectManifest,
        governance: &BTreeMap<String, EffectivePolicy>,
        ctx: &StageContext,
    ) -> Result<EnforcementResult, ProducerError> {
        let mut result = EnforcementResult::default();

        if let Some(policy) = governance.get("naming_convention") {
            ctx.checkpoint()?;
            result.checked.push("naming_convention".to_string());
            match policy.value.as_str() {
                Some("snake_case") => {
                    for model in project.models.iter().filter(|m| !is_snake_case(&m.name)) {
                        result.violations.push(Violation {
                            policy: "naming_convention".to_string(),
                            subject: model.name.clone(),
                            message: "model name is not snake_case".to_string(),
                        });
                    }
                }
                _ => result.violations.push(Violation {
                    policy: "naming_convention".to_string(),
                    subject: "governance".to_string(),
                    message: format!("unsupported naming convention {}", policy.value),
                }),
            }
        }

        if let Some(policy) = governance.get("max_models") {
            ctx.checkpoint()?;
            result.checked.push("max_models".to_string());
            match policy.value.as_u64() {
                Some(limit) if project.models.len() as u64 > limit => {
                    result.violations.push(Violation {
                        policy: "max_models".to_string(),
                        subject: "project".to_string(),
                        message: format!(
                            "{} models exceed the limit of {limit}",
                            project.models.len()
                        ),
                    })
                }
                Some(_) => {}
                None => result.violations.push(Violation {
                    policy: "max_models".to_string(),
                    subject: "governance".to_string(),
                    message: format!("expected a non-negative integer, got {}", policy.value),
                }),
            }
        }

        Ok(result)
    }
}

fn is_snake_case(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.contains("__")
        && !name.ends_with('_')
}
