//! End-to-end pipeline scenarios against the in-memory backends.

use bytes::Bytes;
use tonic::Code;

use crate::api::{Blob, CacheHit, CachePolicy, PlatformProperty, RespError};
use crate::cmd::CrossConfig;
use crate::fixtures::{
    adapter_config, cmd_config, embedded_input, exec_request, ok_execute_response, test_env,
    uploaded_action, uploaded_command,
};
use crate::path::PathStyle;

#[tokio::test]
async fn relocatable_clang_compile() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[("a.o", b"ELF obj")], 0, b""));

    let req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-Iinclude", "-o", "a.o"],
        vec![
            embedded_input("/work/src/a.c", b"int main() { return 0; }"),
            embedded_input("/work/include/a.h", b"extern int x;"),
        ],
    );
    let resp = env.adapter.handle(req).await.unwrap();

    assert!(resp.error_messages.is_empty(), "{:?}", resp.error_messages);
    assert!(resp.missing.is_empty());
    assert_eq!(resp.cache_hit, CacheHit::NoCache);
    let result = resp.result.as_ref().unwrap();
    assert_eq!(result.exit_status, Some(0));
    assert_eq!(result.output_files.len(), 1);
    assert_eq!(result.output_files[0].filename, "a.o");
    assert_eq!(
        result.output_files[0].blob,
        Blob::Embedded(Bytes::from_static(b"ELF obj"))
    );

    let command = uploaded_command(&env.cas, &resp.cache_key).await;
    assert_eq!(
        command.arguments,
        vec!["./run.sh", "clang", "-c", "src/a.c", "-Iinclude", "-o", "a.o"],
    );
    assert_eq!(command.output_files, vec!["a.o"]);
    // Relocatable: no InputRootAbsolutePath pinned.
    let platform = command.platform.as_ref().unwrap();
    assert!(platform
        .properties
        .iter()
        .all(|p| p.name != "InputRootAbsolutePath"));
    // Environment strictly increasing by name.
    let names: Vec<&str> = command
        .environment_variables
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert!(names.windows(2).all(|w| w[0] < w[1]));
    assert!(names.contains(&"WORK_DIR"));

    // The embedded inputs also reached the file service.
    assert!(env.file_service.upload_calls() >= 1);
    assert_eq!(env.execution.requests().len(), 1);
    assert!(!env.execution.requests()[0].skip_cache_lookup);
}

#[tokio::test]
async fn non_relocatable_gcc_pins_input_root() {
    let env = test_env(
        cmd_config("gcc", PathStyle::Posix, CrossConfig::default()),
        &["gcc"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[("a.o", b"obj")], 0, b""));

    let mut req = exec_request(
        "gcc",
        "/src",
        &["gcc", "-c", "/src/a.c", "-I/usr/include", "-o", "/src/a.o"],
        vec![embedded_input("/src/a.c", b"int x;")],
    );
    req.env = vec!["FOO=bar".into()];
    let resp = env.adapter.handle(req).await.unwrap();

    assert!(resp.error_messages.is_empty(), "{:?}", resp.error_messages);
    let command = uploaded_command(&env.cas, &resp.cache_key).await;
    let platform = command.platform.as_ref().unwrap();
    let input_root = platform
        .properties
        .iter()
        .find(|p| p.name == "InputRootAbsolutePath")
        .expect("pinned input root");
    assert_eq!(input_root.value, "/src");
    // Same wrapper script; env forwarded.
    assert_eq!(command.arguments[0], "./run.sh");
    assert!(command
        .environment_variables
        .iter()
        .any(|e| e.name == "FOO" && e.value == "bar"));
    assert_eq!(command.output_files, vec!["a.o"]);
}

#[tokio::test]
async fn windows_cross_rewrites_and_downgrades() {
    let env = test_env(
        cmd_config(
            "clang-cl",
            PathStyle::Windows,
            CrossConfig {
                windows_cross: true,
                clang_need_target: false,
            },
        ),
        &["C:\\tc\\bin\\clang-cl.exe.bat"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[], 0, b""));

    let mut req = exec_request(
        "clang-cl",
        "C:\\src",
        &["clang-cl.exe", "/c", "C:\\src\\a.c"],
        vec![embedded_input("C:\\src\\a.c", b"int main;")],
    );
    req.env = vec![
        "INCLUDE=C:\\sdk\\inc;C:\\other".into(),
        "LIB=C:\\sdk\\lib".into(),
    ];
    let resp = env.adapter.handle(req).await.unwrap();

    assert!(resp.error_messages.is_empty(), "{:?}", resp.error_messages);
    let command = uploaded_command(&env.cas, &resp.cache_key).await;
    // Absolute input makes this non-relocatable; the Windows strategy is
    // downgraded to the POSIX input-root-absolute wrapper.
    assert_eq!(command.arguments[0], "src/run.sh");
    assert_eq!(
        &command.arguments[1..],
        &[
            "/tc/bin/clang-cl.exe",
            "/c",
            "/src/a.c",
            "-imsvc/sdk/inc",
            "-imsvc/other",
        ],
    );
    // INCLUDE/LIB were consumed by the rewrite, not forwarded.
    assert!(command
        .environment_variables
        .iter()
        .all(|e| e.name != "INCLUDE" && e.name != "LIB"));
    let platform = command.platform.as_ref().unwrap();
    let input_root = platform
        .properties
        .iter()
        .find(|p| p.name == "InputRootAbsolutePath")
        .expect("pinned input root");
    // Drive letter dropped for the POSIX sandbox.
    assert_eq!(input_root.value, "/");
}

#[tokio::test]
async fn missing_input_reports_without_executing() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    let req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![crate::api::Input {
            filename: "/work/src/a.c".into(),
            hash_key: "0".repeat(64),
            content: None,
        }],
    );
    let resp = env.adapter.handle(req).await.unwrap();

    assert_eq!(resp.missing.len(), 1);
    assert_eq!(resp.missing[0].filename, "/work/src/a.c");
    assert!(!resp.missing[0].reason.is_empty());
    assert!(resp.result.is_none());
    assert!(env.execution.requests().is_empty());
    assert_eq!(env.cas.blob_count(), 0);
}

#[tokio::test]
async fn action_cache_hit_skips_execution() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[("a.o", b"obj1")], 0, b""));

    let req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    let first = env.adapter.handle(req.clone()).await.unwrap();
    assert_eq!(first.cache_hit, CacheHit::NoCache);
    assert_eq!(env.execution.requests().len(), 1);

    // Seed the action cache with the known action digest and re-run.
    let action_digest = crate::fixtures::parse_cache_key(&first.cache_key);
    let cached_obj = env.cas.insert(Bytes::from_static(b"obj2"));
    env.action_cache.put(
        &action_digest,
        rexa_reapi::ActionResult {
            output_files: vec![rexa_reapi::OutputFile {
                path: "a.o".into(),
                digest: Some(cached_obj),
                is_executable: false,
                contents: Bytes::new(),
            }],
            exit_code: 0,
            ..Default::default()
        },
    );

    let second = env.adapter.handle(req).await.unwrap();
    assert_eq!(second.cache_hit, CacheHit::StorageCache);
    assert_eq!(second.cache_key, first.cache_key);
    // No further execution; outputs come from the byte stream.
    assert_eq!(env.execution.requests().len(), 1);
    let result = second.result.unwrap();
    assert_eq!(
        result.output_files[0].blob,
        Blob::Embedded(Bytes::from_static(b"obj2"))
    );
}

#[tokio::test]
async fn docker_infrastructure_failure_is_internal() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution.respond_with(rexa_reapi::ExecuteResponse {
        result: Some(rexa_reapi::ActionResult {
            exit_code: 127,
            stdout_raw: Bytes::from_static(
                b"docker: Error response from daemon: oci runtime error: exec failed",
            ),
            ..Default::default()
        }),
        ..Default::default()
    });

    let req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    let status = env.adapter.handle(req).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
}

#[tokio::test]
async fn store_only_skips_lookup_but_stores() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[], 0, b""));

    let mut req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    req.cache_policy = CachePolicy::StoreOnly;
    let resp = env.adapter.handle(req).await.unwrap();

    let execute = &env.execution.requests()[0];
    assert!(execute.skip_cache_lookup);
    let action = uploaded_action(&env.cas, &resp.cache_key).await;
    assert!(!action.do_not_cache);
}

#[tokio::test]
async fn lookup_only_does_not_cache() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[], 0, b""));

    let mut req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    req.cache_policy = CachePolicy::LookupOnly;
    let resp = env.adapter.handle(req).await.unwrap();

    let action = uploaded_action(&env.cas, &resp.cache_key).await;
    assert!(action.do_not_cache);
}

#[tokio::test]
async fn unsafe_platform_property_is_a_bad_request() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    let mut req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    req.requester_info.platform_properties = vec![
        PlatformProperty {
            name: "dockerPrivileged".into(),
            value: "true".into(),
        },
        PlatformProperty {
            name: "dockerRuntime".into(),
            value: "kata".into(),
        },
    ];
    let resp = env.adapter.handle(req).await.unwrap();
    assert_eq!(resp.error, Some(RespError::BadRequest));
    assert_eq!(resp.error_messages.len(), 2);
    assert!(env.execution.requests().is_empty());
}

#[tokio::test]
async fn safe_platform_overrides_apply() {
    let env = test_env(
        cmd_config("clang", PathStyle::Posix, CrossConfig::default()),
        &["clang"],
        adapter_config(),
    );
    env.execution
        .respond_with(ok_execute_response(&env.cas, &[], 0, b""));

    let mut req = exec_request(
        "clang",
        "/work",
        &["clang", "-c", "src/a.c", "-o", "a.o"],
        vec![embedded_input("/work/src/a.c", b"int x;")],
    );
    req.requester_info.platform_properties = vec![PlatformProperty {
        name: "cache-silo".into(),
        value: "team-x".into(),
    }];
    let resp = env.adapter.handle(req).await.unwrap();
    assert!(resp.error_messages.is_empty());
    let command = uploaded_command(&env.cas, &resp.cache_key).await;
    let platform = command.platform.as_ref().unwrap();
    assert!(platform
        .properties
        .iter()
        .any(|p| p.name == "cache-silo" && p.value == "team-x"));
    // Platform properties strictly increasing by name.
    assert!(platform
        .properties
        .windows(2)
        .all(|w| w[0].name < w[1].name));
}
