//! Derives `TaskRequirements` from a task definition plus user-configured
//! task rules (spec §4.5), and implements the two substitution
//! mini-languages: path-pattern substitution (for rule-overridden output
//! paths) and command-line substitution (for building a provider's
//! argv).

use std::path::Path;

use fusion_core::config::{CpuConstraint, Preference, TaskRule};
use fusion_core::error::{FusionError, Result};
use fusion_core::ids::{TaskId, VerRef};

use crate::resources::volume::VolumeManager;

/// One declared input of a `TaskDef`: an unresolved URI.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub uri: String,
}

/// One declared output of a `TaskDef`. `volume: None` is the `*anytmp*`
/// sentinel: the Resource Manager picks a concrete tmp volume at
/// activation time (spec §4.3 `ProviderCanSatisfy`).
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub path: String,
    pub volume: Option<String>,
    pub size_estimate: u64,
}

#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub commands: Vec<CommandTemplate>,
}

#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub uri: String,
    pub volume: String,
    pub host: String,
    pub locality: Preference,
}

#[derive(Debug, Clone)]
pub struct ResolvedOutput {
    pub path: String,
    /// `None` means `*anytmp*`: still unresolved to a concrete volume.
    pub volume: Option<String>,
    pub host: Option<String>,
    pub size_estimate: u64,
    pub locality: Preference,
    /// Indexed by input position; `Must` forbids sharing that input's
    /// volume, `Prefer` deprioritises it (spec §4.3 `ProviderCanSatisfy`).
    pub different_volumes: Vec<Preference>,
}

#[derive(Debug, Clone)]
pub struct TaskRequirements {
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<ResolvedOutput>,
    pub cpu: CpuConstraint,
    pub required_volume_hosts: Vec<String>,
    pub required_build_host: Option<String>,
    pub preferred_build_host: Option<String>,
}

/// Values substitutable into an output path pattern (spec §4.5
/// "Path-pattern substitution").
pub struct PathSubstContext<'a> {
    pub taskid: TaskId,
    pub default_path: &'a str,
    pub verref: &'a VerRef,
}

impl TaskRequirements {
    /// Builds a task's requirements from its definition, resolving every
    /// input/output through the volume manager and applying the
    /// matching task rule (spec §4.5 steps 1-5).
    pub fn build(
        taskid: TaskId,
        verref: &VerRef,
        taskdef: &TaskDef,
        rule: Option<&TaskRule>,
        volumes: &VolumeManager,
    ) -> Result<Self> {
        let mut inputs = Vec::with_capacity(taskdef.inputs.len());
        for (index, input) in taskdef.inputs.iter().enumerate() {
            let (volume, path) = parse_khfile_uri(&input.uri)
                .map_err(|msg| FusionError::task_construction(verref.to_string(), msg))?;
            let host = volumes.volume_host(volume).ok_or_else(|| {
                FusionError::task_construction(
                    verref.to_string(),
                    format!("input `{}` resolves to unknown volume `{volume}`", input.uri),
                )
            })?;
            let mut locality = Preference::DontCare;
            if let Some(rule) = rule {
                if let Some(ic) = rule.inputs.iter().find(|ic| ic.index == index) {
                    locality = ic.locality;
                }
            }
            let _ = path;
            inputs.push(ResolvedInput {
                uri: input.uri.clone(),
                volume: volume.to_owned(),
                host: host.to_owned(),
                locality,
            });
        }

        let mut outputs = Vec::with_capacity(taskdef.outputs.len());
        for (index, output) in taskdef.outputs.iter().enumerate() {
            let mut path = output.path.clone();
            let mut volume = output.volume.clone();
            let mut locality = Preference::DontCare;
            let mut different_volumes = vec![Preference::DontCare; inputs.len()];

            if let Some(rule) = rule {
                if let Some(oc) = rule.outputs.iter().find(|oc| oc.index == index) {
                    if let Some(v) = &oc.volume {
                        volume = Some(v.clone());
                    }
                    if let Some(pattern) = &oc.path {
                        let ctx = PathSubstContext {
                            taskid,
                            default_path: &output.path,
                            verref,
                        };
                        path = substitute_path_pattern(pattern, &ctx);
                    }
                    if let Some(loc) = oc.locality {
                        locality = loc;
                    }
                    for (i, pref) in oc.different_volumes.iter().enumerate() {
                        if i < different_volumes.len() {
                            different_volumes[i] = *pref;
                        }
                    }
                }
            }

            let host = match &volume {
                Some(v) => Some(
                    volumes
                        .volume_host(v)
                        .ok_or_else(|| {
                            FusionError::task_construction(
                                verref.to_string(),
                                format!("output volume `{v}` is unknown"),
                            )
                        })?
                        .to_owned(),
                ),
                None => None,
            };

            outputs.push(ResolvedOutput {
                path,
                volume,
                host,
                size_estimate: output.size_estimate,
                locality,
                different_volumes,
            });
        }

        let cpu = rule
            .and_then(|r| r.cpu.clone())
            .unwrap_or(CpuConstraint { min: 1, max: 1 });

        check_static_conflicts(verref, &inputs, &outputs)?;

        let required_build_host = compute_required_host(verref, &inputs, &outputs)?;
        let preferred_build_host = inputs
            .iter()
            .find(|i| i.locality == Preference::Prefer)
            .map(|i| i.host.clone())
            .or_else(|| {
                outputs
                    .iter()
                    .find(|o| o.locality == Preference::Prefer)
                    .and_then(|o| o.host.clone())
            });

        let mut required_volume_hosts: Vec<String> = inputs.iter().map(|i| i.host.clone()).collect();
        required_volume_hosts.extend(outputs.iter().filter_map(|o| o.host.clone()));
        required_volume_hosts.sort();
        required_volume_hosts.dedup();

        Ok(TaskRequirements {
            inputs,
            outputs,
            cpu,
            required_volume_hosts,
            required_build_host,
            preferred_build_host,
        })
    }
}

/// Intersects every `Must`-locality host across inputs and fixed-volume
/// outputs (spec §C, carried from `original_source`'s
/// `TaskRequirements.cpp`: the *intersection*, not the first Must host
/// seen). More than one distinct host in that intersection is a static
/// conflict.
fn compute_required_host(
    verref: &VerRef,
    inputs: &[ResolvedInput],
    outputs: &[ResolvedOutput],
) -> Result<Option<String>> {
    let mut hosts: Vec<&str> = inputs
        .iter()
        .filter(|i| i.locality == Preference::Must)
        .map(|i| i.host.as_str())
        .collect();
    hosts.extend(
        outputs
            .iter()
            .filter(|o| o.locality == Preference::Must)
            .filter_map(|o| o.host.as_deref()),
    );
    hosts.sort_unstable();
    hosts.dedup();
    match hosts.len() {
        0 => Ok(None),
        1 => Ok(Some(hosts[0].to_owned())),
        _ => Err(FusionError::task_construction(
            verref.to_string(),
            format!("conflicting Must-locality hosts: {}", hosts.join(", ")),
        )),
    }
}

fn check_static_conflicts(
    verref: &VerRef,
    inputs: &[ResolvedInput],
    outputs: &[ResolvedOutput],
) -> Result<()> {
    for output in outputs {
        let Some(output_volume) = &output.volume else {
            continue;
        };
        for (index, pref) in output.different_volumes.iter().enumerate() {
            if *pref == Preference::Must {
                if let Some(input) = inputs.get(index) {
                    if &input.volume == output_volume {
                        return Err(FusionError::task_construction(
                            verref.to_string(),
                            format!(
                                "output must be on a different volume than input #{index}, but both are on `{output_volume}`"
                            ),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_khfile_uri(uri: &str) -> std::result::Result<(&str, &str), String> {
    let rest = uri
        .strip_prefix("khfile://")
        .ok_or_else(|| format!("`{uri}` is missing the khfile:// scheme"))?;
    let (volume, path) = rest
        .split_once('/')
        .ok_or_else(|| format!("`{uri}` has no path component"))?;
    if volume.is_empty() || path.is_empty() {
        return Err(format!("`{uri}` has an empty volume or path"));
    }
    Ok((volume, path))
}

#[derive(Clone, Copy)]
enum PathTransform {
    Basename,
    Dirname,
    Sansext,
    Ext,
}

fn apply_path_transform(value: &str, transform: Option<PathTransform>) -> String {
    let Some(transform) = transform else {
        return value.to_owned();
    };
    let path = Path::new(value);
    match transform {
        PathTransform::Basename => path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        PathTransform::Dirname => path
            .parent()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        PathTransform::Sansext => path
            .with_extension("")
            .to_string_lossy()
            .into_owned(),
        PathTransform::Ext => path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

fn parse_transform_suffix(suffix: &str) -> Option<PathTransform> {
    match suffix {
        "basename" => Some(PathTransform::Basename),
        "dirname" => Some(PathTransform::Dirname),
        "sansext" => Some(PathTransform::Sansext),
        "ext" => Some(PathTransform::Ext),
        _ => None,
    }
}

/// Scans `pattern` for `$taskid`, `$defaultpath`, `$vernum`, `$assetref`
/// tokens (each optionally followed by `:basename`/`:dirname`/
/// `:sansext`/`:ext`) and substitutes their value. Unrecognised `$`
/// tokens are passed through verbatim.
pub fn substitute_path_pattern(pattern: &str, ctx: &PathSubstContext<'_>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            let run_end = pattern[i..].find('$').map(|off| i + off).unwrap_or(bytes.len());
            out.push_str(&pattern[i..run_end]);
            i = run_end;
            continue;
        }
        let start = i;
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric()) {
            j += 1;
        }
        let name = &pattern[i + 1..j];
        let mut k = j;
        let mut suffix: Option<&str> = None;
        if k < bytes.len() && bytes[k] == b':' {
            let suffix_start = k + 1;
            let mut m = suffix_start;
            while m < bytes.len() && bytes[m].is_ascii_alphabetic() {
                m += 1;
            }
            suffix = Some(&pattern[suffix_start..m]);
            k = m;
        }
        let transform = suffix.and_then(parse_transform_suffix);
        let raw = match name {
            "taskid" => Some(ctx.taskid.to_string()),
            "defaultpath" => Some(ctx.default_path.to_owned()),
            "vernum" => Some(format!("{:03}", ctx.verref.version())),
            "assetref" => Some(ctx.verref.asset().to_string()),
            _ => None,
        };
        match raw {
            Some(value) if suffix.is_none() || transform.is_some() => {
                out.push_str(&apply_path_transform(&value, transform));
                i = k;
            }
            _ => {
                out.push_str(&pattern[start..j]);
                i = j;
            }
        }
    }
    out
}

#[derive(Clone, Copy)]
enum CommandToken {
    OutputsAll,
    InputsAll,
    OutputIndex(usize),
    InputIndex(usize),
    NumCpu,
}

fn parse_command_token(head: &str) -> Option<CommandToken> {
    match head {
        "$OUTPUT" => Some(CommandToken::OutputIndex(0)),
        "$INPUT" => Some(CommandToken::InputIndex(0)),
        "$OUTPUTS" => Some(CommandToken::OutputsAll),
        "$INPUTS" => Some(CommandToken::InputsAll),
        "$NUMCPU" => Some(CommandToken::NumCpu),
        _ => {
            if let Some(inner) = head.strip_prefix("$OUTPUTS[").and_then(|s| s.strip_suffix(']')) {
                inner.parse().ok().map(CommandToken::OutputIndex)
            } else if let Some(inner) = head.strip_prefix("$INPUTS[").and_then(|s| s.strip_suffix(']')) {
                inner.parse().ok().map(CommandToken::InputIndex)
            } else {
                None
            }
        }
    }
}

/// Expands one command template's argument list into a provider argv,
/// per spec §4.5 "Command-line substitution". List tokens (`$OUTPUTS`,
/// `$INPUTS`) expand a single argument into many; everything else stays
/// one-for-one. An argument that is not exactly a recognised token (with
/// an optional `:transform` suffix) is passed through verbatim.
pub fn substitute_command_line(
    args: &[String],
    inputs: &[String],
    outputs: &[String],
    numcpu: u32,
) -> Vec<String> {
    let mut result = Vec::with_capacity(args.len());
    for arg in args {
        let (head, suffix) = match arg.split_once(':') {
            Some((h, s)) => (h, Some(s)),
            None => (arg.as_str(), None),
        };
        let Some(token) = parse_command_token(head) else {
            result.push(arg.clone());
            continue;
        };
        let transform = suffix.and_then(parse_transform_suffix);
        if suffix.is_some() && transform.is_none() {
            result.push(arg.clone());
            continue;
        }
        match token {
            CommandToken::OutputsAll => {
                result.extend(outputs.iter().map(|v| apply_path_transform(v, transform)));
            }
            CommandToken::InputsAll => {
                result.extend(inputs.iter().map(|v| apply_path_transform(v, transform)));
            }
            CommandToken::OutputIndex(n) => {
                if let Some(v) = outputs.get(n) {
                    result.push(apply_path_transform(v, transform));
                } else {
                    result.push(arg.clone());
                }
            }
            CommandToken::InputIndex(n) => {
                if let Some(v) = inputs.get(n) {
                    result.push(apply_path_transform(v, transform));
                } else {
                    result.push(arg.clone());
                }
            }
            CommandToken::NumCpu => result.push(numcpu.to_string()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::ids::AssetRef;

    fn ctx(verref: &VerRef) -> PathSubstContext<'_> {
        PathSubstContext {
            taskid: TaskId(7),
            default_path: "/data/vol_a/orig.tif",
            verref,
        }
    }

    #[test]
    fn path_pattern_substitutes_known_tokens() {
        let verref = AssetRef::new("Foo").version(3);
        let pattern = "$defaultpath:dirname/out_$taskid_$vernum.tif";
        let rendered = substitute_path_pattern(pattern, &ctx(&verref));
        assert_eq!(rendered, "/data/vol_a/out_7_003.tif");
    }

    #[test]
    fn path_pattern_passes_through_unknown_tokens() {
        let verref = AssetRef::new("Foo").version(1);
        let rendered = substitute_path_pattern("$unknownthing/x", &ctx(&verref));
        assert_eq!(rendered, "$unknownthing/x");
    }

    #[test]
    fn command_line_expands_list_tokens_to_multiple_args() {
        let args = vec!["--inputs".to_owned(), "$INPUTS".to_owned(), "$NUMCPU".to_owned()];
        let inputs = vec!["a".to_owned(), "b".to_owned()];
        let outputs = vec!["c".to_owned()];
        let expanded = substitute_command_line(&args, &inputs, &outputs, 4);
        assert_eq!(expanded, vec!["--inputs", "a", "b", "4"]);
    }

    #[test]
    fn command_line_applies_basename_transform() {
        let args = vec!["$OUTPUT:basename".to_owned()];
        let outputs = vec!["/data/vol_a/out.tif".to_owned()];
        let expanded = substitute_command_line(&args, &[], &outputs, 1);
        assert_eq!(expanded, vec!["out.tif"]);
    }

    #[test]
    fn command_line_passes_unknown_token_through() {
        let args = vec!["$WEIRD".to_owned()];
        let expanded = substitute_command_line(&args, &[], &[], 1);
        assert_eq!(expanded, vec!["$WEIRD"]);
    }
}
