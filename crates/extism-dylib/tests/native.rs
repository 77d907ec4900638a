//! End-to-end tests against a real `libextism`.
//!
//! Every test is `#[ignore]`d because it needs the native shared
//! library installed (or `EXTISM_LIB_DIR` pointing at it). Run with
//! `cargo test -- --ignored`. Guest modules are assembled inline from
//! wat so no fixture files are required.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use extism_dylib::{
    CompiledPlugin, DataWasmSource, Error, HostFunction, HostOutput, Manifest, MemoryArena,
    MemoryHandle, ParamKind, Plugin, PluginOptions, Runtime, ValType,
};

const NOOP: &str = r#"(module (func (export "noop") (result i32) (i32.const 0)))"#;

const INFINITE: &str = r#"(module
  (func (export "infinite") (result i32)
    (loop $spin (br $spin))
    (i32.const 0)))"#;

const ECHO: &str = r#"(module
  (import "extism:host/env" "input_length" (func $input_length (result i64)))
  (import "extism:host/env" "input_load_u8" (func $input_load_u8 (param i64) (result i32)))
  (import "extism:host/env" "alloc" (func $alloc (param i64) (result i64)))
  (import "extism:host/env" "store_u8" (func $store_u8 (param i64 i32)))
  (import "extism:host/env" "output_set" (func $output_set (param i64 i64)))
  (func (export "echo") (result i32)
    (local $len i64) (local $block i64) (local $i i64)
    (local.set $len (call $input_length))
    (local.set $block (call $alloc (local.get $len)))
    (block $done
      (loop $copy
        (br_if $done (i64.ge_u (local.get $i) (local.get $len)))
        (call $store_u8
          (i64.add (local.get $block) (local.get $i))
          (call $input_load_u8 (local.get $i)))
        (local.set $i (i64.add (local.get $i) (i64.const 1)))
        (br $copy)))
    (call $output_set (local.get $block) (local.get $len))
    (i32.const 0)))"#;

// copies the call input into a block, hands its offset to the host,
// and returns whatever block the host hands back
const TRANSFORM: &str = r#"(module
  (import "extism:host/env" "input_length" (func $input_length (result i64)))
  (import "extism:host/env" "input_load_u8" (func $input_load_u8 (param i64) (result i32)))
  (import "extism:host/env" "alloc" (func $alloc (param i64) (result i64)))
  (import "extism:host/env" "store_u8" (func $store_u8 (param i64 i32)))
  (import "extism:host/env" "length" (func $length (param i64) (result i64)))
  (import "extism:host/env" "output_set" (func $output_set (param i64 i64)))
  (import "extism:host/user" "transform" (func $transform (param i64) (result i64)))
  (func (export "run") (result i32)
    (local $len i64) (local $block i64) (local $i i64) (local $result i64)
    (local.set $len (call $input_length))
    (local.set $block (call $alloc (local.get $len)))
    (block $done
      (loop $copy
        (br_if $done (i64.ge_u (local.get $i) (local.get $len)))
        (call $store_u8
          (i64.add (local.get $block) (local.get $i))
          (call $input_load_u8 (local.get $i)))
        (local.set $i (i64.add (local.get $i) (i64.const 1)))
        (br $copy)))
    (local.set $result (call $transform (local.get $block)))
    (call $output_set (local.get $result) (call $length (local.get $result)))
    (i32.const 0)))"#;

const FETCH: &str = r#"(module
  (import "extism:host/env" "length" (func $length (param i64) (result i64)))
  (import "extism:host/env" "output_set" (func $output_set (param i64 i64)))
  (import "extism:host/user" "fetch" (func $fetch (result i64)))
  (func (export "run") (result i32)
    (local $block i64)
    (local.set $block (call $fetch))
    (call $output_set (local.get $block) (call $length (local.get $block)))
    (i32.const 0)))"#;

const MULT: &str = r#"(module
  (import "extism:host/user" "mult" (func $mult (param i64 i64) (result i64)))
  (func (export "run") (result i32)
    (drop (call $mult (i64.const 6) (i64.const 7)))
    (i32.const 0)))"#;

const NAMESPACED_FETCH: &str = r#"(module
  (import "extism:host/env" "length" (func $length (param i64) (result i64)))
  (import "extism:host/env" "output_set" (func $output_set (param i64 i64)))
  (import "example:custom" "fetch" (func $fetch (result i64)))
  (func (export "run") (result i32)
    (local $block i64)
    (local.set $block (call $fetch))
    (call $output_set (local.get $block) (call $length (local.get $block)))
    (i32.const 0)))"#;

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::load().expect("libextism must be installed (or set EXTISM_LIB_DIR)")
}

fn manifest(wat_source: &str) -> Manifest {
    let module = wat::parse_str(wat_source).expect("valid wat");
    Manifest::new(DataWasmSource::new(module))
}

fn plugin(runtime: &Runtime, wat_source: &str, functions: Vec<HostFunction>) -> Plugin {
    Plugin::new(runtime, &manifest(wat_source), functions, PluginOptions::new())
        .expect("instantiation succeeds")
}

#[test]
#[ignore = "requires libextism"]
fn runtime_reports_a_version() {
    let runtime = runtime();
    assert!(!runtime.version().is_empty());
}

#[test]
#[ignore = "requires libextism"]
fn echo_round_trips_input() {
    let runtime = runtime();
    let mut plugin = plugin(&runtime, ECHO, vec![]);
    let output = plugin.call("echo", "Hello, world!").unwrap();
    assert_eq!(output, b"Hello, world!");
}

#[test]
#[ignore = "requires libextism"]
fn from_bytes_accepts_a_bare_module() {
    let runtime = runtime();
    let module = wat::parse_str(NOOP).unwrap();
    let mut plugin =
        Plugin::from_bytes(&runtime, &module, vec![], PluginOptions::new()).unwrap();
    assert_eq!(plugin.call("noop", "").unwrap(), Vec::<u8>::new());
}

#[test]
#[ignore = "requires libextism"]
fn function_exists_probes_exports() {
    let runtime = runtime();
    let plugin = plugin(&runtime, NOOP, vec![]);
    assert!(plugin.function_exists("noop"));
    assert!(!plugin.function_exists("missing"));
    assert!(!plugin.function_exists("no\0op"));
}

#[test]
#[ignore = "requires libextism"]
fn calling_a_missing_export_fails() {
    let runtime = runtime();
    let mut plugin = plugin(&runtime, NOOP, vec![]);
    let err = plugin.call("missing", "").unwrap_err();
    assert!(matches!(err, Error::Call { ref function, .. } if function == "missing"));
}

#[test]
#[ignore = "requires libextism"]
fn instantiation_failure_reports_a_message() {
    let runtime = runtime();
    let err = Plugin::from_bytes(&runtime, b"not wasm", vec![], PluginOptions::new()).unwrap_err();
    assert!(matches!(err, Error::PluginLoad { .. }));
}

#[test]
#[ignore = "requires libextism"]
fn reset_keeps_the_instance_usable() {
    let runtime = runtime();
    let mut plugin = plugin(&runtime, ECHO, vec![]);
    plugin.call("echo", "one").unwrap();
    assert!(plugin.reset());
    assert_eq!(plugin.call("echo", "two").unwrap(), b"two");
}

#[test]
#[ignore = "requires libextism"]
fn plugin_ids_are_stable_and_distinct() {
    let runtime = runtime();
    let first = plugin(&runtime, NOOP, vec![]);
    let second = plugin(&runtime, NOOP, vec![]);
    assert_eq!(first.id(), first.id());
    assert_ne!(first.id(), second.id());
    assert_eq!(first.id().len(), 36);
}

#[test]
#[ignore = "requires libextism"]
fn timeout_aborts_a_runaway_call() {
    let runtime = runtime();
    let manifest = manifest(INFINITE).with_timeout_ms(100);
    let mut plugin = Plugin::new(&runtime, &manifest, vec![], PluginOptions::new()).unwrap();
    match plugin.call("infinite", "").unwrap_err() {
        Error::Call { message, .. } => {
            assert!(message.to_lowercase().contains("timeout"), "{message}");
        }
        other => panic!("expected Call, got {other:?}"),
    }
}

#[test]
#[ignore = "requires libextism"]
fn fuel_limit_aborts_a_runaway_call() {
    let runtime = runtime();
    let options = PluginOptions::new().with_fuel_limit(10_000);
    let mut plugin = Plugin::new(&runtime, &manifest(INFINITE), vec![], options).unwrap();
    match plugin.call("infinite", "").unwrap_err() {
        Error::Call { message, .. } => {
            assert!(message.to_lowercase().contains("fuel"), "{message}");
        }
        other => panic!("expected Call, got {other:?}"),
    }
}

#[test]
#[ignore = "requires libextism"]
fn cancel_handle_aborts_from_another_thread() {
    let runtime = runtime();
    let mut plugin = plugin(&runtime, INFINITE, vec![]);
    let handle = plugin.cancel_handle();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        handle.cancel()
    });
    let err = plugin.call("infinite", "").unwrap_err();
    assert!(matches!(err, Error::Call { .. }));
    assert!(canceller.join().unwrap());
}

#[test]
#[ignore = "requires libextism"]
fn host_function_receives_dereferenced_strings() {
    let runtime = runtime();
    let transform = HostFunction::new(
        &runtime,
        "transform",
        &[ValType::I64],
        &[ValType::I64],
        &[ParamKind::Context, ParamKind::StringOffset],
        |_, args| {
            let text = args[0].as_str().unwrap();
            Ok(HostOutput::from(text.to_uppercase()))
        },
    )
    .unwrap();

    let mut plugin = plugin(&runtime, TRANSFORM, vec![transform]);
    assert_eq!(plugin.call("run", "shout").unwrap(), b"SHOUT");
}

#[test]
#[ignore = "requires libextism"]
fn host_function_receives_raw_integers() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mult = HostFunction::new(
        &runtime,
        "mult",
        &[ValType::I64, ValType::I64],
        &[ValType::I64],
        &[ParamKind::Integer, ParamKind::Integer],
        move |_, args| {
            let product = args[0].as_i64().unwrap() * args[1].as_i64().unwrap();
            sink.lock().push(product);
            Ok(HostOutput::from(product))
        },
    )
    .unwrap();

    let mut plugin = plugin(&runtime, MULT, vec![mult]);
    plugin.call("run", "").unwrap();
    assert_eq!(*seen.lock(), vec![42]);
}

#[test]
#[ignore = "requires libextism"]
fn host_function_error_surfaces_as_call_failure() {
    let runtime = runtime();
    let fetch = HostFunction::new(
        &runtime,
        "fetch",
        &[],
        &[ValType::I64],
        &[],
        |_, _| Err(Error::Memory("backend offline".to_string())),
    )
    .unwrap();

    let mut plugin = plugin(&runtime, FETCH, vec![fetch]);
    let err = plugin.call("run", "").unwrap_err();
    match err {
        Error::Call { function, message } => {
            assert_eq!(function, "run");
            assert!(message.contains("backend offline"));
        }
        other => panic!("expected Call, got {other:?}"),
    }
}

#[test]
#[ignore = "requires libextism"]
fn host_function_panic_is_contained() {
    let runtime = runtime();
    let fetch = HostFunction::new(
        &runtime,
        "fetch",
        &[],
        &[ValType::I64],
        &[],
        |_, _| panic!("host bug"),
    )
    .unwrap();

    let mut plugin = plugin(&runtime, FETCH, vec![fetch]);
    let err = plugin.call("run", "").unwrap_err();
    assert!(matches!(err, Error::Call { ref message, .. } if message.contains("host bug")));
    // the instance survives the aborted call
    let err = plugin.call("run", "").unwrap_err();
    assert!(matches!(err, Error::Call { .. }));
}

#[test]
#[ignore = "requires libextism"]
fn host_context_is_scoped_to_one_call() {
    let runtime = runtime();
    let fetch = HostFunction::new(
        &runtime,
        "fetch",
        &[],
        &[ValType::I64],
        &[ParamKind::Context],
        |current, _| {
            let context: Option<serde_json::Value> = current.host_context()?;
            let user = context
                .and_then(|c| c["user"].as_str().map(str::to_owned))
                .unwrap_or_else(|| "anonymous".to_string());
            Ok(HostOutput::from(user))
        },
    )
    .unwrap();

    let mut plugin = plugin(&runtime, FETCH, vec![fetch]);
    let output = plugin
        .call_with_host_context("run", "", &serde_json::json!({ "user": "ada" }))
        .unwrap();
    assert_eq!(output, b"ada");

    let output = plugin
        .call_with_host_context("run", "", &serde_json::json!({ "user": "grace" }))
        .unwrap();
    assert_eq!(output, b"grace");

    // plain calls carry no context
    assert_eq!(plugin.call("run", "").unwrap(), b"anonymous");
}

#[test]
#[ignore = "requires libextism"]
fn namespace_override_satisfies_custom_imports() {
    let runtime = runtime();

    let make_fetch = || {
        HostFunction::new(
            &runtime,
            "fetch",
            &[],
            &[ValType::I64],
            &[],
            |_, _| Ok(HostOutput::from("ok")),
        )
        .unwrap()
    };

    // default namespace does not match the guest's import
    let err = Plugin::new(
        &runtime,
        &manifest(NAMESPACED_FETCH),
        vec![make_fetch()],
        PluginOptions::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::PluginLoad { .. }));

    let mut fetch = make_fetch();
    fetch.set_namespace("example:custom").unwrap();
    let mut plugin = plugin(&runtime, NAMESPACED_FETCH, vec![fetch]);
    assert_eq!(plugin.call("run", "").unwrap(), b"ok");
}

#[test]
#[ignore = "requires libextism"]
fn reset_invalidates_earlier_memory_tokens() {
    let runtime = runtime();
    let slot: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
    let fetch = HostFunction::new(
        &runtime,
        "fetch",
        &[],
        &[ValType::I64],
        &[ParamKind::Context],
        move |current, _| {
            let mut stashed = slot.lock();
            match stashed.take() {
                None => {
                    let handle = current.write_block(b"cached")?;
                    *stashed = Some(handle.offset());
                    Ok(HostOutput::from("stored"))
                }
                Some(offset) => {
                    let bytes = current.read_block(MemoryHandle::from(offset))?;
                    Ok(HostOutput::Bytes(bytes))
                }
            }
        },
    )
    .unwrap();

    let mut plugin = plugin(&runtime, FETCH, vec![fetch]);
    assert_eq!(plugin.call("run", "").unwrap(), b"stored");
    assert!(plugin.reset());

    // the token from before the reset must not resolve to its old bytes
    let output = plugin.call("run", "").unwrap();
    assert_ne!(output, b"cached");
    assert!(output.is_empty(), "stale block yielded {output:?}");
}

#[test]
#[ignore = "requires libextism"]
fn compiled_instances_report_host_failures_to_their_own_caller() {
    let runtime = runtime();
    let fetch = HostFunction::new(
        &runtime,
        "fetch",
        &[],
        &[ValType::I64],
        &[ParamKind::Context],
        |current, _| {
            let poisoned: Option<serde_json::Value> = current.host_context()?;
            if poisoned.is_some() {
                return Err(Error::Memory("backend offline".to_string()));
            }
            Ok(HostOutput::from("ok"))
        },
    )
    .unwrap();

    let compiled = CompiledPlugin::new(&runtime, &manifest(FETCH), vec![fetch], false).unwrap();
    let mut failing = compiled.instantiate().unwrap();
    let mut clean = compiled.instantiate().unwrap();

    // both instances share the descriptor set; failures on one thread's
    // calls must neither leak into nor be wiped by the other's
    let failing_calls = std::thread::spawn(move || {
        for _ in 0..100 {
            let err = failing
                .call_with_host_context("run", "", &serde_json::json!({ "poison": true }))
                .unwrap_err();
            assert!(
                matches!(err, Error::Call { ref message, .. } if message.contains("backend offline")),
                "expected the host failure, got {err:?}"
            );
        }
    });
    let clean_calls = std::thread::spawn(move || {
        for _ in 0..100 {
            assert_eq!(clean.call("run", "").unwrap(), b"ok");
        }
    });
    failing_calls.join().unwrap();
    clean_calls.join().unwrap();
}

#[test]
#[ignore = "requires libextism"]
fn compiled_plugin_instances_are_independent() {
    let runtime = runtime();
    let compiled =
        CompiledPlugin::new(&runtime, &manifest(ECHO), vec![], false).unwrap();

    let mut first = compiled.instantiate().unwrap();
    let mut second = compiled.instantiate().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(first.call("echo", "one").unwrap(), b"one");
    assert_eq!(second.call("echo", "two").unwrap(), b"two");
    assert_eq!(first.call("echo", "three").unwrap(), b"three");
}

#[test]
#[ignore = "requires libextism"]
fn unknown_log_level_is_rejected() {
    let runtime = runtime();
    let dir = tempfile::tempdir().unwrap();
    let err = runtime
        .set_log_file(dir.path().join("extism.log"), "not-a-level")
        .unwrap_err();
    assert!(matches!(err, Error::Logging(_)));
}

#[test]
#[ignore = "requires libextism"]
fn update_config_applies_to_later_calls() {
    let runtime = runtime();
    let manifest = manifest(NOOP).with_config("mode", "fast");
    let mut plugin = Plugin::new(&runtime, &manifest, vec![], PluginOptions::new()).unwrap();
    plugin.call("noop", "").unwrap();

    let mut config = BTreeMap::new();
    config.insert("mode".to_string(), "slow".to_string());
    plugin.update_config(&config).unwrap();
    plugin.call("noop", "").unwrap();
}
