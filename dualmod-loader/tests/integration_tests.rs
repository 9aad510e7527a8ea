//! Integration tests for the dual-format loader

use dualmod_loader::{
    async_body, sync_body, BodyTable, EvalContext, FileSystem, LoadError, LoaderConfig, MemoryFs,
    ModuleBody, ModuleFormat, ModuleLoader, ModuleLocation, ModuleRegistry, ModuleState, ObjectRef,
    RealFs, ResolutionMode, Value,
};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn loader(fs: MemoryFs, bodies: BodyTable) -> ModuleLoader {
    ModuleLoader::builder()
        .file_system(Arc::new(fs))
        .bodies(bodies)
        .build()
}

fn loc(path: &str) -> ModuleLocation {
    ModuleLocation::new(path)
}

/// The `my-logger` package: a legacy module exporting a class and an instance
fn logger_package(fs: MemoryFs) -> MemoryFs {
    fs.with_file(
        "/app/node_modules/my-logger/package.json",
        r#"{ "name": "my-logger", "main": "index.js", "exports": { ".": "./index.js" } }"#,
    )
    .with_file(
        "/app/node_modules/my-logger/index.js",
        "class Logger {}\nmodule.exports = new Logger();\nmodule.exports.Logger = Logger;\n",
    )
    .with_file("/app/node_modules/my-logger/utils.js", "exports.format = function () {};\n")
}

fn logger_body() -> Arc<dyn ModuleBody> {
    sync_body(|cx| {
        let class = ObjectRef::class("Logger", None);
        let instance = class.construct();
        instance.set("Logger", Value::from(class));
        cx.set_module_exports(instance);
        Ok(())
    })
}

#[tokio::test]
async fn test_declarative_imports_legacy_package() {
    let fs = logger_package(MemoryFs::new()).with_file(
        "/app/main.mjs",
        "import { Logger } from 'my-logger';\nimport logger from 'my-logger';\nexport { Logger, logger };\n",
    );
    let bodies = BodyTable::new().with("/app/node_modules/my-logger/index.js", logger_body());
    let loader = loader(fs, bodies);

    let ns = loader.load("/app/main.mjs").await.unwrap();
    let class = ns.get("Logger").unwrap();
    let instance = ns.get("logger").unwrap();
    assert!(instance.instance_of(&class));
    assert!(instance.get("Logger").strict_equals(&class));

    let record = loader.registry().get(&loc("/app/node_modules/my-logger/index.js")).unwrap();
    assert_eq!(record.format, ModuleFormat::Legacy);
    assert_eq!(record.state, ModuleState::Evaluated);
    let names: Vec<_> = record.namespace.unwrap().names().map(str::to_string).collect();
    assert_eq!(names, vec!["Logger".to_string(), "default".to_string()]);
}

#[tokio::test]
async fn test_undetectable_named_export_fails_at_link() {
    let fs = MemoryFs::new()
        .with_file(
            "/app/node_modules/dynamic/index.js",
            "const key = 'Hidden';\nmodule.exports[key] = 1;\n",
        )
        .with_file("/app/named.mjs", "import { Hidden } from 'dynamic';\n")
        .with_file(
            "/app/default.mjs",
            "import dynamic from 'dynamic';\nexport { dynamic };\n",
        );
    let bodies = BodyTable::new().with(
        "/app/node_modules/dynamic/index.js",
        sync_body(|cx| cx.export("Hidden", 1i64)),
    );
    let loader = loader(fs, bodies);

    let err = loader.load("/app/named.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_NAMED_EXPORT_NOT_FOUND");
    assert!(err.to_string().contains("Named export 'Hidden' not found"));
    // nothing from the failed link is committed
    assert!(!loader.registry().contains(&loc("/app/named.mjs")));
    assert!(!loader.registry().contains(&loc("/app/node_modules/dynamic/index.js")));

    let ns = loader.load("/app/default.mjs").await.unwrap();
    assert_eq!(ns.get("dynamic").unwrap().get("Hidden").as_number(), Some(1.0));
}

#[tokio::test]
async fn test_modules_evaluate_at_most_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let fs = MemoryFs::new()
        .with_file("/app/shared.cjs", "exports.value = 1;\n")
        .with_file("/app/a.mjs", "import { value } from './shared.cjs';\nexport { value };\n")
        .with_file("/app/b.mjs", "import shared from './shared.cjs';\nexport default shared;\n")
        .with_file("/app/main.mjs", "import './a.mjs';\nimport './b.mjs';\n");
    let counter = runs.clone();
    let bodies = BodyTable::new().with(
        "/app/shared.cjs",
        sync_body(move |cx| {
            counter.fetch_add(1, Ordering::SeqCst);
            cx.export("value", 1i64)
        }),
    );
    let loader = loader(fs, bodies);

    let first = loader.load("/app/main.mjs").await.unwrap();
    let second = loader.load("/app/main.mjs").await.unwrap();
    assert!(first.ptr_eq(&second));
    loader.load("/app/b.mjs").await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let a = loader.registry().get(&loc("/app/a.mjs")).unwrap().namespace.unwrap();
    assert_eq!(a.get("value").unwrap().as_number(), Some(1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_evaluation() {
    let runs = Arc::new(AtomicUsize::new(0));
    let fs = MemoryFs::new()
        .with_file("/app/slow.mjs", "await setup();\nexport const ready = true;\n")
        .with_file("/app/main.mjs", "import { ready } from './slow.mjs';\nexport { ready };\n");
    let counter = runs.clone();
    let bodies = BodyTable::new().with(
        "/app/slow.mjs",
        async_body(move |cx: EvalContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                cx.export("ready", true)
            }
        }),
    );
    let loader = loader(fs, bodies);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load("/app/main.mjs").await })
        })
        .collect();
    for handle in handles {
        let ns = handle.await.unwrap().unwrap();
        assert!(matches!(ns.get("ready").unwrap(), Value::Bool(true)));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_legacy_cycle_sees_partial_exports() {
    let fs = MemoryFs::new()
        .with_file("/app/a.cjs", "exports.early = 1;\nconst b = require('./b.cjs');\n")
        .with_file("/app/b.cjs", "const a = require('./a.cjs');\nexports.sawEarly = a.early;\n");
    let bodies = BodyTable::new()
        .with(
            "/app/a.cjs",
            sync_body(|cx| {
                cx.export("early", 1i64)?;
                let b = cx.require("./b.cjs")?;
                cx.export("fromB", b.get("sawEarly"))
            }),
        )
        .with(
            "/app/b.cjs",
            sync_body(|cx| {
                let a = cx.require("./a.cjs")?;
                cx.export("sawEarly", a.get("early"))?;
                cx.export("sawLate", a.get("fromB"))
            }),
        );
    let loader = loader(fs, bodies);

    let ns = loader.load_sync("/app/a.cjs").unwrap();
    let a = ns.get("default").unwrap();
    assert_eq!(a.get("fromB").as_number(), Some(1.0));

    let b = loader.registry().get(&loc("/app/b.cjs")).unwrap().exports.unwrap();
    assert_eq!(b.get("sawEarly").as_number(), Some(1.0));
    assert!(b.get("sawLate").is_undefined());

    let cycle = loader.registry().detect_cycle();
    assert_eq!(cycle.len(), 2);
    assert!(cycle.iter().all(|edge| edge.mode == ResolutionMode::DynamicSync && !edge.deferred));
}

#[tokio::test]
async fn test_eager_mixed_cycle_is_rejected() {
    let fs = MemoryFs::new()
        .with_file("/app/a.mjs", "import b from './b.cjs';\nexport const name = 'a';\n")
        .with_file("/app/b.cjs", "const a = require('./a.mjs');\nmodule.exports = { a };\n");
    let loader = loader(fs, BodyTable::new());

    let err = loader.load("/app/a.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_REQUIRE_CYCLE_MODULE");
    match err {
        LoadError::RequireCycleModule { requester, target } => {
            assert_eq!(requester, loc("/app/b.cjs"));
            assert_eq!(target, loc("/app/a.mjs"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(loader.registry().is_empty());
}

#[tokio::test]
async fn test_deferred_mixed_cycle_is_allowed() {
    let fs = MemoryFs::new()
        .with_file("/app/a.mjs", "import getA from './b.cjs';\nexport const name = 'a';\n")
        .with_file(
            "/app/b.cjs",
            "module.exports = function () {\n  return require('./a.mjs');\n};\n",
        );
    let saved: Arc<Mutex<Option<EvalContext>>> = Arc::new(Mutex::new(None));
    let slot = saved.clone();
    let bodies = BodyTable::new()
        .with("/app/a.mjs", sync_body(|cx| cx.export("name", "a")))
        .with(
            "/app/b.cjs",
            sync_body(move |cx| {
                *slot.lock() = Some(cx.clone());
                cx.set_module_exports(ObjectRef::function("getA"));
                Ok(())
            }),
        );
    let loader = loader(fs, bodies);

    loader.load("/app/a.mjs").await.unwrap();
    let edges = loader.registry().detect_cycle();
    assert!(edges
        .iter()
        .any(|edge| edge.from == loc("/app/b.cjs") && edge.deferred));

    // the function body runs after both modules completed
    let cx = saved.lock().clone().unwrap();
    let a = cx.require("./a.mjs").unwrap();
    let ns = a.as_namespace().unwrap();
    assert_eq!(ns.get("name").unwrap().as_str(), Some("a"));
}

/// l.cjs -> d.mjs -> m.cjs -> l.cjs, every request at top level
fn legacy_closed_cycle() -> (MemoryFs, BodyTable) {
    let fs = MemoryFs::new()
        .with_file(
            "/app/l.cjs",
            "exports.early = 1;\nconst d = require('./d.mjs');\nexports.seen = d.seen;\n",
        )
        .with_file("/app/d.mjs", "import m from './m.cjs';\nexport const seen = m.sawEarly;\n")
        .with_file("/app/m.cjs", "const l = require('./l.cjs');\nexports.sawEarly = l.early;\n");
    let bodies = BodyTable::new()
        .with(
            "/app/l.cjs",
            sync_body(|cx| {
                cx.export("early", 1i64)?;
                let d = cx.require("./d.mjs")?;
                cx.export("seen", d.get("seen"))
            }),
        )
        .with(
            "/app/d.mjs",
            sync_body(|cx| {
                let m = cx.import_binding("m")?;
                cx.export("seen", m.get("sawEarly"))
            }),
        )
        .with(
            "/app/m.cjs",
            sync_body(|cx| {
                let l = cx.require("./l.cjs")?;
                cx.export("sawEarly", l.get("early"))
            }),
        );
    (fs, bodies)
}

#[test]
fn test_mixed_cycle_closed_by_legacy_require() {
    let (fs, bodies) = legacy_closed_cycle();
    let loader = loader(fs, bodies);

    let ns = loader.load_sync("/app/l.cjs").unwrap();
    assert_eq!(ns.get("default").unwrap().get("seen").as_number(), Some(1.0));
    for path in ["/app/l.cjs", "/app/d.mjs", "/app/m.cjs"] {
        assert_eq!(loader.registry().state(&loc(path)), Some(ModuleState::Evaluated));
    }
    assert_eq!(loader.registry().detect_cycle().len(), 3);
}

#[tokio::test]
async fn test_mixed_cycle_entered_from_declarative_side() {
    // d.mjs is mid-evaluation when l.cjs requires it
    let (fs, bodies) = legacy_closed_cycle();
    let loader = loader(fs, bodies);

    let err = loader.load("/app/d.mjs").await.unwrap_err();
    match err {
        LoadError::RequireCycleModule { requester, target } => {
            assert_eq!(requester, loc("/app/l.cjs"));
            assert_eq!(target, loc("/app/d.mjs"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_runtime_require_of_evaluating_importer() {
    // the request is computed at runtime, so linking cannot see it
    let fs = MemoryFs::new()
        .with_file("/app/a.mjs", "import './b.cjs';\nexport const name = 'a';\n")
        .with_file("/app/b.cjs", "const name = './a' + '.mjs';\nrequire(name);\n");
    let bodies = BodyTable::new().with(
        "/app/b.cjs",
        sync_body(|cx| cx.require("./a.mjs").map(|_| ())),
    );
    let loader = loader(fs, bodies);

    let err = loader.load("/app/a.mjs").await.unwrap_err();
    match err {
        LoadError::RequireCycleModule { requester, target } => {
            assert_eq!(requester, loc("/app/b.cjs"));
            assert_eq!(target, loc("/app/a.mjs"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(loader.registry().state(&loc("/app/a.mjs")), Some(ModuleState::Errored));
}

#[tokio::test]
async fn test_errored_module_rethrows() {
    let runs = Arc::new(AtomicUsize::new(0));
    let fs = MemoryFs::new()
        .with_file("/app/broken.cjs", "throw new Error('boom');\n")
        .with_file("/app/main.mjs", "import './broken.cjs';\n");
    let counter = runs.clone();
    let bodies = BodyTable::new().with(
        "/app/broken.cjs",
        sync_body(move |cx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(cx.throw("boom"))
        }),
    );
    let loader = loader(fs, bodies);

    let first = loader.load("/app/main.mjs").await.unwrap_err();
    let second = loader.load("/app/main.mjs").await.unwrap_err();
    assert_eq!(first.code(), "ERR_EVALUATION");
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let record = loader.registry().get(&loc("/app/broken.cjs")).unwrap();
    assert_eq!(record.state, ModuleState::Errored);
    assert!(record.error.is_some());
}

#[tokio::test]
async fn test_require_of_async_module_is_rejected() {
    let fs = MemoryFs::new()
        .with_file("/app/main.cjs", "const tla = require('./tla.mjs');\n")
        .with_file("/app/tla.mjs", "await Promise.resolve();\nexport const ready = true;\n");
    let bodies = BodyTable::new()
        .with("/app/main.cjs", sync_body(|cx| cx.require("./tla.mjs").map(|_| ())))
        .with(
            "/app/tla.mjs",
            async_body(|cx: EvalContext| async move {
                tokio::task::yield_now().await;
                cx.export("ready", true)
            }),
        );
    let loader = loader(fs, bodies);

    let err = loader.load_sync("/app/main.cjs").unwrap_err();
    assert_eq!(err.code(), "ERR_REQUIRE_ASYNC_MODULE");
    // rejected before anything ran
    assert_eq!(loader.registry().state(&loc("/app/tla.mjs")), Some(ModuleState::Linked));

    let ns = loader.load("/app/tla.mjs").await.unwrap();
    assert!(matches!(ns.get("ready").unwrap(), Value::Bool(true)));
}

#[tokio::test]
async fn test_suspending_require_abandons_started_records() {
    // no top-level await in the source, so only the single poll can catch it
    let fs = MemoryFs::new()
        .with_file("/app/main.cjs", "require('./lib.mjs');\n")
        .with_file("/app/lib.mjs", "export const value = 1;\n");
    let bodies = BodyTable::new()
        .with("/app/main.cjs", sync_body(|cx| cx.require("./lib.mjs").map(|_| ())))
        .with(
            "/app/lib.mjs",
            async_body(|cx: EvalContext| async move {
                tokio::task::yield_now().await;
                cx.export("value", 1i64)
            }),
        );
    let loader = loader(fs, bodies);

    let err = loader.load_sync("/app/main.cjs").unwrap_err();
    assert_eq!(err.code(), "ERR_REQUIRE_ASYNC_MODULE");

    let lib = loader.registry().get(&loc("/app/lib.mjs")).unwrap();
    assert_eq!(lib.state, ModuleState::Errored);
    assert_eq!(lib.error.unwrap().code(), "ERR_EVALUATION_ABANDONED");
    let err = loader.load("/app/lib.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_EVALUATION_ABANDONED");
}

#[test]
fn test_require_of_declarative_module() {
    let fs = MemoryFs::new()
        .with_file("/app/api.mjs", "const api = {};\nexport { api as 'module.exports' };\nexport const extra = 1;\n")
        .with_file("/app/plain.mjs", "export const answer = 42;\nexport default 'plain';\n")
        .with_file("/app/main.cjs", "require('./api.mjs');\nrequire('./plain.mjs');\n");
    let results: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let api = ObjectRef::plain();
    api.set("version", Value::from(2i64));
    let exported = api.clone();
    let bodies = BodyTable::new()
        .with(
            "/app/api.mjs",
            sync_body(move |cx| {
                cx.export("api", exported.clone())?;
                cx.export("extra", 1i64)
            }),
        )
        .with(
            "/app/plain.mjs",
            sync_body(|cx| {
                cx.export("answer", 42i64)?;
                cx.export("default", "plain")
            }),
        )
        .with(
            "/app/main.cjs",
            sync_body(move |cx| {
                let mut sink = sink.lock();
                sink.push(cx.require("./api.mjs")?);
                sink.push(cx.require("./plain.mjs")?);
                Ok(())
            }),
        );
    let loader = loader(fs, bodies);

    loader.load_sync("/app/main.cjs").unwrap();
    let results = results.lock();
    assert!(results[0].strict_equals(&Value::from(api)));
    let plain = results[1].as_namespace().unwrap();
    assert_eq!(plain.get("answer").unwrap().as_number(), Some(42.0));
    assert_eq!(plain.get("default").unwrap().as_str(), Some("plain"));
}

#[tokio::test]
async fn test_live_and_snapshot_bindings() {
    let fs = MemoryFs::new()
        .with_file("/app/counter.mjs", "export let count = 0;\n")
        .with_file("/app/legacy.cjs", "exports.count = 0;\n")
        .with_file(
            "/app/main.mjs",
            "import { count } from './counter.mjs';\nimport { count as legacyCount } from './legacy.cjs';\nexport { count, legacyCount };\n",
        );
    let contexts: Arc<Mutex<Vec<EvalContext>>> = Arc::new(Mutex::new(Vec::new()));
    let (c1, c2) = (contexts.clone(), contexts.clone());
    let bodies = BodyTable::new()
        .with(
            "/app/counter.mjs",
            sync_body(move |cx| {
                c1.lock().push(cx.clone());
                cx.export("count", 0i64)
            }),
        )
        .with(
            "/app/legacy.cjs",
            sync_body(move |cx| {
                c2.lock().push(cx.clone());
                cx.export("count", 0i64)
            }),
        );
    let loader = loader(fs, bodies);

    let ns = loader.load("/app/main.mjs").await.unwrap();
    for cx in contexts.lock().iter() {
        cx.export("count", 5i64).unwrap();
    }
    assert_eq!(ns.get("count").unwrap().as_number(), Some(5.0));
    assert_eq!(ns.get("legacyCount").unwrap().as_number(), Some(0.0));
}

#[tokio::test]
async fn test_dynamic_import_of_importer_cycle() {
    let fs = MemoryFs::new()
        .with_file("/app/a.mjs", "const b = await import('./b.mjs');\nexport let fromB;\n")
        .with_file("/app/b.mjs", "import * as a from './a.mjs';\nexport const name = 'b';\n");
    let bodies = BodyTable::new()
        .with(
            "/app/a.mjs",
            async_body(|cx: EvalContext| async move {
                let b = cx.import("./b.mjs").await?;
                cx.export("fromB", b.get("name")?)
            }),
        )
        .with(
            "/app/b.mjs",
            sync_body(|cx| {
                // a is still evaluating
                assert!(cx.namespace("a")?.get("fromB").is_err());
                cx.export("name", "b")
            }),
        );
    let loader = loader(fs, bodies);

    let ns = tokio::time::timeout(Duration::from_secs(5), loader.load("/app/a.mjs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ns.get("fromB").unwrap().as_str(), Some("b"));
}

#[tokio::test]
async fn test_resolution_errors_in_graph() {
    let fs = logger_package(MemoryFs::new())
        .with_file("/app/utils/index.js", "exports.ok = true;\n")
        .with_file("/app/dir.mjs", "import './utils';\n")
        .with_file("/app/noext.mjs", "import './utils/index';\n")
        .with_file("/app/private.mjs", "import 'my-logger/utils.js';\n")
        .with_file("/app/private.cjs", "require('my-logger/utils.js');\n")
        .with_file("/app/dir.cjs", "require('./utils');\n");
    let bodies = BodyTable::new()
        .with("/app/private.cjs", sync_body(|cx| cx.require("my-logger/utils.js").map(|_| ())))
        .with("/app/dir.cjs", sync_body(|cx| cx.require("./utils").map(|_| ())));
    let loader = loader(fs, bodies);

    let err = loader.load("/app/dir.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_UNSUPPORTED_DIR_IMPORT");
    let err = loader.load("/app/noext.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_MODULE_NOT_FOUND");
    let err = loader.load("/app/private.mjs").await.unwrap_err();
    assert_eq!(err.code(), "ERR_PACKAGE_PATH_NOT_EXPORTED");
    let err = loader.load_sync("/app/private.cjs").unwrap_err();
    assert_eq!(err.code(), "ERR_PACKAGE_PATH_NOT_EXPORTED");

    loader.load_sync("/app/dir.cjs").unwrap();
    assert_eq!(
        loader.registry().state(&loc("/app/utils/index.js")),
        Some(ModuleState::Evaluated)
    );
}

#[tokio::test]
async fn test_json_module() {
    let fs = MemoryFs::new()
        .with_file("/app/data.json", r#"{ "name": "demo", "tags": ["a", "b"] }"#)
        .with_file("/app/main.mjs", "import data from './data.json';\nexport { data };\n");
    let loader = loader(fs, BodyTable::new());

    let ns = loader.load("/app/main.mjs").await.unwrap();
    let data = ns.get("data").unwrap();
    assert_eq!(data.get("name").as_str(), Some("demo"));
    let json = loader.registry().get(&loc("/app/data.json")).unwrap().namespace.unwrap();
    assert_eq!(json.names().collect::<Vec<_>>(), vec!["default"]);
}

#[test]
fn test_real_fs_package_resolution() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    let package_dir = root.join("node_modules").join("dual");
    fs::create_dir_all(package_dir.join("dist")).unwrap();
    fs::write(
        package_dir.join("package.json"),
        r#"{
  "name": "dual",
  "exports": {
    ".": { "import": "./dist/index.mjs", "require": "./dist/index.cjs" },
    "./features/*": "./dist/features/*.js",
    "./features/internal/*": null
  }
}"#,
    )
    .unwrap();
    fs::write(package_dir.join("dist/index.mjs"), "export default 1;\n").unwrap();
    fs::write(package_dir.join("dist/index.cjs"), "module.exports = 1;\n").unwrap();
    fs::create_dir_all(package_dir.join("dist/features/internal")).unwrap();
    fs::write(package_dir.join("dist/features/color.js"), "exports.red = 1;\n").unwrap();
    fs::write(package_dir.join("dist/features/internal/secret.js"), "").unwrap();
    fs::write(root.join("main.mjs"), "import dual from 'dual';\n").unwrap();

    let loader = ModuleLoader::builder()
        .file_system(Arc::new(RealFs))
        .config(LoaderConfig::default())
        .build();
    let entry = loader.link(root.join("main.mjs")).unwrap();
    let dist = package_dir.join("dist");

    let esm = loader.resolve("dual", &entry, ResolutionMode::Static).unwrap();
    assert_eq!(esm.path(), dist.join("index.mjs"));
    let cjs = loader.resolve("dual", &entry, ResolutionMode::DynamicSync).unwrap();
    assert_eq!(cjs.path(), dist.join("index.cjs"));
    let feature = loader
        .resolve("dual/features/color", &entry, ResolutionMode::DynamicAsync)
        .unwrap();
    assert_eq!(feature.path(), dist.join("features/color.js"));
    let err = loader
        .resolve("dual/features/internal/secret", &entry, ResolutionMode::Static)
        .unwrap_err();
    assert_eq!(err.code(), "ERR_PACKAGE_PATH_NOT_EXPORTED");

    assert_eq!(loader.classify(&esm).unwrap(), ModuleFormat::Declarative);
    assert_eq!(loader.classify(&feature).unwrap(), ModuleFormat::Legacy);
    assert_eq!(loader.registry().state(&esm), Some(ModuleState::Linked));
    assert!(entry.path().is_absolute());
}

#[tokio::test]
async fn test_regex_literal_before_declarations() {
    let fs = MemoryFs::new()
        .with_file(
            "/app/main.mjs",
            "const re = /'/;\nimport { x } from './dep.mjs';\nexport { x };\n",
        )
        .with_file("/app/detect.js", "const quote = /\"/g;\nimport './dep.mjs';\n")
        .with_file("/app/dep.mjs", "export const x = 1;\n");
    let bodies = BodyTable::new().with("/app/dep.mjs", sync_body(|cx| cx.export("x", 1i64)));
    let loader = loader(fs, bodies);

    let ns = loader.load("/app/main.mjs").await.unwrap();
    assert_eq!(ns.get("x").unwrap().as_number(), Some(1.0));
    assert_eq!(loader.registry().state(&loc("/app/dep.mjs")), Some(ModuleState::Evaluated));
    assert_eq!(loader.classify(&loc("/app/detect.js")).unwrap(), ModuleFormat::Declarative);
}

type ContextLog = Arc<Mutex<Vec<(PathBuf, PathBuf, String, bool)>>>;

fn context_body(log: ContextLog) -> Arc<dyn ModuleBody> {
    sync_body(move |cx| {
        log.lock().push((
            cx.filename().to_path_buf(),
            cx.dirname().to_path_buf(),
            cx.url(),
            cx.is_main(),
        ));
        Ok(())
    })
}

#[tokio::test]
async fn test_module_context_locals() {
    let fs = MemoryFs::new()
        .with_file("/app/src/main.mjs", "import './lib.cjs';\nconsole.log(import.meta.url);\n")
        .with_file("/app/src/lib.cjs", "console.log(__filename, require.main === module);\n")
        .with_file("/app/other.cjs", "console.log(require.main === module);\n");
    let log: ContextLog = Arc::new(Mutex::new(Vec::new()));
    let bodies = BodyTable::new()
        .with("/app/src/main.mjs", context_body(log.clone()))
        .with("/app/src/lib.cjs", context_body(log.clone()))
        .with("/app/other.cjs", context_body(log.clone()));
    let loader = loader(fs, bodies);
    assert!(loader.main().is_none());

    loader.load("/app/src/main.mjs").await.unwrap();
    // a second entry does not replace the main module
    loader.load_sync("/app/other.cjs").unwrap();
    assert_eq!(loader.main(), Some(loc("/app/src/main.mjs")));

    let log = log.lock();
    assert_eq!(
        log[0],
        (
            PathBuf::from("/app/src/lib.cjs"),
            PathBuf::from("/app/src"),
            "file:///app/src/lib.cjs".to_string(),
            false
        )
    );
    assert_eq!(log[1].0, PathBuf::from("/app/src/main.mjs"));
    assert_eq!(log[1].2, "file:///app/src/main.mjs");
    assert!(log[1].3);
    assert_eq!(log[2].0, PathBuf::from("/app/other.cjs"));
    assert!(!log[2].3);
}

/// Records the registry state of one module whenever a file is read
#[derive(Debug)]
struct RecordingFs {
    files: MemoryFs,
    watched: ModuleLocation,
    registry: Mutex<Option<ModuleRegistry>>,
    states: Mutex<Vec<Option<ModuleState>>>,
}

impl FileSystem for RecordingFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        if let Some(registry) = self.registry.lock().as_ref() {
            self.states.lock().push(registry.state(&self.watched));
        }
        self.files.read_to_string(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.is_file(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files.is_dir(path)
    }
}

#[tokio::test]
async fn test_record_lifecycle_states() {
    let files = MemoryFs::new()
        .with_file("/app/main.mjs", "import { value } from './dep.mjs';\nexport { value };\n")
        .with_file("/app/dep.mjs", "export const value = 1;\n")
        .with_file("/app/broken.mjs", "import { missing } from './dep.mjs';\n");
    let fs = Arc::new(RecordingFs {
        files,
        watched: loc("/app/main.mjs"),
        registry: Mutex::new(None),
        states: Mutex::new(Vec::new()),
    });
    let loader = ModuleLoader::builder().file_system(fs.clone()).build();
    *fs.registry.lock() = Some(loader.registry().clone());

    loader.link("/app/main.mjs").unwrap();
    {
        // main.mjs is Linking while its source and its dependency are read
        let states = fs.states.lock();
        assert!(!states.is_empty());
        assert!(states.iter().all(|state| *state == Some(ModuleState::Linking)));
    }
    assert_eq!(loader.registry().state(&loc("/app/main.mjs")), Some(ModuleState::Linked));
    loader.load("/app/main.mjs").await.unwrap();
    assert_eq!(loader.registry().state(&loc("/app/main.mjs")), Some(ModuleState::Evaluated));

    // a record created before linking returns to Unlinked when its link fails
    let broken = loc("/app/broken.mjs");
    let created = loader.registry().get_or_create(&broken, ModuleFormat::Declarative);
    assert_eq!(created.state, ModuleState::Unlinked);
    let err = loader.link("/app/broken.mjs").unwrap_err();
    assert_eq!(err.code(), "ERR_NAMED_EXPORT_NOT_FOUND");
    assert_eq!(loader.registry().state(&broken), Some(ModuleState::Unlinked));
}
