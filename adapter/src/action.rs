//! Assembles the RE `Command` and `Action` messages and records their
//! digests, which identify the action everywhere downstream.

use std::collections::BTreeMap;

use rexa_reapi as reapi;
use tracing::info;

use crate::digest::{self, Data, Store};
use crate::input::RootContext;
use crate::path;
use crate::Error;

/// Collapses `KEY=value` pairs (last wins, duplicates logged) and sorts
/// them by name, as the backend requires.
pub fn create_env_vars(envs: &[String]) -> Vec<reapi::command::EnvironmentVariable> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for env in envs {
        let (key, value) = env.split_once('=').unwrap_or((env.as_str(), ""));
        if let Some(old) = map.insert(key.to_owned(), value.to_owned()) {
            info!(key, old, new = value, "duplicate env var");
        }
    }
    map.into_iter()
        .map(|(name, value)| reapi::command::EnvironmentVariable { name, value })
        .collect()
}

pub struct CommandParams<'a> {
    pub args: &'a [String],
    pub envs: &'a [String],
    /// Platform properties, already de-duplicated by name.
    pub platform: &'a [(String, String)],
    /// Output files and directories in client form.
    pub outputs: &'a [String],
    pub output_dirs: &'a [String],
    pub root: &'a RootContext,
    pub windows_cross: bool,
}

/// Builds the `Command`: argv as given, environment and platform sorted,
/// output paths root-relative and sorted (POSIX-converted for a Windows
/// cross compile, whose sandbox reads POSIX paths).
pub fn new_command(params: CommandParams<'_>) -> Result<reapi::Command, Error> {
    let mut properties: Vec<reapi::platform::Property> = params
        .platform
        .iter()
        .map(|(name, value)| reapi::platform::Property {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    properties.sort_by(|a, b| a.name.cmp(&b.name));

    let mut command = reapi::Command {
        arguments: params.args.to_vec(),
        environment_variables: create_env_vars(params.envs),
        platform: Some(reapi::Platform { properties }),
        ..Default::default()
    };

    for output in params.outputs {
        let mut rel = params
            .root
            .root_rel(output)
            .map_err(|e| Error::internal(format!("output {}: {}", output, e)))?;
        if params.windows_cross {
            rel = path::to_posix(&rel);
        }
        command.output_files.push(rel);
    }
    command.output_files.sort();

    for output in params.output_dirs {
        let mut rel = params
            .root
            .root_rel(output)
            .map_err(|e| Error::internal(format!("output dir {}: {}", output, e)))?;
        if params.windows_cross {
            rel = path::to_posix(&rel);
        }
        command.output_directories.push(rel);
    }
    command.output_directories.sort();

    Ok(command)
}

/// Serializes the command and action into the digest store and returns
/// the action together with its digest — the request's cache key.
pub fn setup_action(
    command: &reapi::Command,
    input_root_digest: reapi::Digest,
    do_not_cache: bool,
    store: &mut Store,
) -> (reapi::Action, reapi::Digest) {
    let (command_digest, encoded) = digest::of_message(command);
    info!(digest = %command_digest, "command digest");
    store.set(Data::bytes("command", encoded));

    let action = reapi::Action {
        command_digest: Some(command_digest),
        input_root_digest: Some(input_root_digest),
        timeout: None,
        do_not_cache,
    };
    let (action_digest, encoded) = digest::of_message(&action);
    info!(digest = %action_digest, "action digest");
    store.set(Data::bytes("action", encoded));
    (action, action_digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathStyle;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn env_vars_collapse_last_wins_and_sort() {
        let envs = strings(&["ZED=1", "ALPHA=a", "ZED=2"]);
        let vars = create_env_vars(&envs);
        let names: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["ALPHA", "ZED"]);
        assert_eq!(vars[1].value, "2");
        assert!(names.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn command_outputs_are_root_relative_and_sorted() {
        let root = RootContext::new(PathStyle::Posix, "/work", "/work");
        let outputs = strings(&["obj/b.o", "a.o"]);
        let command = new_command(CommandParams {
            args: &strings(&["./run.sh", "clang"]),
            envs: &strings(&["WORK_DIR=."]),
            platform: &[("OSFamily".into(), "Linux".into())],
            outputs: &outputs,
            output_dirs: &[],
            root: &root,
            windows_cross: false,
        })
        .unwrap();
        assert_eq!(command.output_files, strings(&["a.o", "obj/b.o"]));
        assert!(command
            .platform
            .as_ref()
            .unwrap()
            .properties
            .windows(2)
            .all(|w| w[0].name < w[1].name));
    }

    #[test]
    fn cross_outputs_become_posix() {
        let root = RootContext::new(PathStyle::Windows, "C:\\work", "C:\\work");
        let outputs = strings(&["obj\\a.obj"]);
        let command = new_command(CommandParams {
            args: &strings(&["./run.sh"]),
            envs: &[],
            platform: &[],
            outputs: &outputs,
            output_dirs: &[],
            root: &root,
            windows_cross: true,
        })
        .unwrap();
        assert_eq!(command.output_files, strings(&["obj/a.obj"]));
    }

    #[test]
    fn action_and_command_land_in_the_store() {
        let command = reapi::Command {
            arguments: strings(&["./run.sh", "clang"]),
            ..Default::default()
        };
        let mut store = Store::default();
        let input_root = crate::digest::of_bytes(b"root");
        let (action, action_digest) = setup_action(&command, input_root.clone(), true, &mut store);

        assert!(action.do_not_cache);
        assert_eq!(action.input_root_digest.as_ref().unwrap(), &input_root);
        assert!(store.get(&action_digest).is_some());
        assert!(store.get(action.command_digest.as_ref().unwrap()).is_some());
    }
}
