//! End-to-end pipeline scenarios against the scripted toolchain
//!
//! Each test gets its own sandbox (Fern sources, project, cache and fake
//! tools under a temp dir) and drives the pipeline the way `terra fire` does.

use std::fs;
use std::time::Duration;

use terra::build::{BuildRequest, ExternalToolchain, LibraryOutcome, Pipeline};
use terra::cache::ArtifactCache;
use terra::config::Backend;
use terra::error::FailureKind;
use terra_integration_tests::fake_toolchain::{ERROR_MESSAGE, SYNTAX_ERROR, write};
use terra_integration_tests::Sandbox;

fn pipeline(sandbox: &Sandbox, backend: Backend) -> Pipeline<'_, ExternalToolchain> {
    Pipeline::new(
        &sandbox.config,
        ExternalToolchain::from_config(&sandbox.config, backend),
    )
}

fn web_request(sandbox: &Sandbox) -> BuildRequest {
    BuildRequest::new(Backend::Web, sandbox.project_dir())
}

#[tokio::test]
async fn test_cold_cache_builds_library_then_project() {
    let sandbox = Sandbox::new().unwrap();
    let result = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();

    assert_eq!(result.library_builds(), 1);
    assert!(!result.library.is_cache_hit());
    assert_eq!(sandbox.toolchain.library_builds(), 1);
    assert_eq!(sandbox.toolchain.links(), 1);

    // Only the web sources of the library are compiled
    let compiles = sandbox.toolchain.invocations();
    assert!(!compiles.iter().any(|line| line.contains("linux_renderer")));

    let output = sandbox.project_dir().join("build/main.html");
    assert_eq!(result.artifact(), output);
    assert!(output.is_file());
    assert!(sandbox.project_dir().join("build/main.js").is_file());
    assert!(sandbox.project_dir().join("build/main.wasm").is_file());

    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    assert!(cache.current(Backend::Web).is_some());
}

#[tokio::test]
async fn test_warm_cache_skips_library_build() {
    let sandbox = Sandbox::new().unwrap();
    pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();
    sandbox.toolchain.reset().unwrap();

    let result = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();

    assert!(result.library.is_cache_hit());
    assert_eq!(result.library_builds(), 0);
    assert_eq!(sandbox.toolchain.object_compiles(), 0);
    assert_eq!(sandbox.toolchain.library_builds(), 0);
    assert_eq!(sandbox.toolchain.links(), 1);
}

#[tokio::test]
async fn test_support_source_changes_invalidate_cache() {
    let sandbox = &Sandbox::new().unwrap();
    let build = || async move {
        sandbox.toolchain.reset().unwrap();
        pipeline(sandbox, Backend::Web)
            .run(&web_request(sandbox))
            .await
            .unwrap()
    };

    let first = build().await;
    let LibraryOutcome::Rebuilt(first_entry) = &first.library else {
        panic!("cold cache must build the library");
    };

    // Added file
    write(
        &sandbox.support_file("src/core/path.cpp"),
        "void path() {}\n",
    )
    .unwrap();
    let added = build().await;
    assert_eq!(added.library_builds(), 1);
    assert_eq!(sandbox.toolchain.library_builds(), 1);

    // Removed file
    fs::remove_file(sandbox.support_file("src/graphics/colors.cpp")).unwrap();
    let removed = build().await;
    assert_eq!(removed.library_builds(), 1);

    // Edited header
    fs::write(
        sandbox.support_file("include/fern/fern.hpp"),
        "#pragma once\nint version();\n",
    )
    .unwrap();
    let edited = build().await;
    assert_eq!(edited.library_builds(), 1);

    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    let current = cache.current(Backend::Web).unwrap();
    assert!(!current.fingerprint.matches(&first_entry.fingerprint));

    // A file outside the support sources does not invalidate
    write(&sandbox.support_file("README.md"), "docs\n").unwrap();
    let untouched = build().await;
    assert_eq!(untouched.library_builds(), 0);
}

#[tokio::test]
async fn test_project_edit_does_not_rebuild_library() {
    let sandbox = Sandbox::new().unwrap();
    pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();
    sandbox.toolchain.reset().unwrap();

    sandbox
        .write_main("int main() { return 1; }\n")
        .unwrap();
    let result = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();

    assert_eq!(result.library_builds(), 0);
    assert_eq!(sandbox.toolchain.links(), 1);
}

#[tokio::test]
async fn test_compiler_failure_keeps_cache_untouched() {
    let sandbox = Sandbox::new().unwrap();
    pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap();
    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    let before = cache.current(Backend::Web).unwrap();

    // Break the library: the warm entry must survive the failed rebuild
    fs::write(
        sandbox.support_file("src/fern.cpp"),
        format!("void fern() {{ {} }}\n", SYNTAX_ERROR),
    )
    .unwrap();
    let err = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Compiler);
    assert_eq!(err.exit_code(), 1);
    assert!(err.diagnostics().unwrap_or_default().contains(ERROR_MESSAGE));

    let after = cache.current(Backend::Web).unwrap();
    assert!(after.fingerprint.matches(&before.fingerprint));
    assert_eq!(after.created, before.created);
}

#[tokio::test]
async fn test_project_compile_error_reports_diagnostics() {
    let sandbox = Sandbox::new().unwrap();
    sandbox
        .write_main(&format!("int main() {{ {} }}\n", SYNTAX_ERROR))
        .unwrap();

    let err = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Compiler);
    let diagnostics = err.diagnostics().unwrap_or_default();
    assert!(diagnostics.contains(ERROR_MESSAGE));
    assert!(diagnostics.contains("main.cpp"));
    assert!(!sandbox.project_dir().join("build/main.html").exists());

    // The library was still cached before the project failed
    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    assert!(cache.current(Backend::Web).is_some());
}

#[tokio::test]
async fn test_clear_then_build_is_cold() {
    let sandbox = Sandbox::new().unwrap();
    let pipeline = pipeline(&sandbox, Backend::Web);
    pipeline.run(&web_request(&sandbox)).await.unwrap();

    let cleared = pipeline.cache().clear(Some(Backend::Web)).unwrap();
    assert_eq!(cleared, vec![Backend::Web]);
    assert!(!pipeline.cache().status(Backend::Web).present());

    sandbox.toolchain.reset().unwrap();
    let result = pipeline.run(&web_request(&sandbox)).await.unwrap();
    assert_eq!(result.library_builds(), 1);
    assert_eq!(sandbox.toolchain.library_builds(), 1);
}

#[tokio::test]
async fn test_concurrent_builders_leave_one_valid_entry() {
    let sandbox = Sandbox::new().unwrap();

    // A second project sharing the same cache
    let other = sandbox.root.join("other");
    write(&other.join("fern.toml"), "name = \"other\"\n").unwrap();
    write(&other.join("lib/main.cpp"), "int main() { return 0; }\n").unwrap();

    let first = pipeline(&sandbox, Backend::Web);
    let second = pipeline(&sandbox, Backend::Web);
    let first_request = web_request(&sandbox);
    let second_request = BuildRequest::new(Backend::Web, &other);
    let (a, b) = tokio::join!(first.run(&first_request), second.run(&second_request));
    a.unwrap();
    b.unwrap();

    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    let entry = cache.current(Backend::Web).unwrap();
    assert!(entry.artifact.is_file());
    assert_eq!(fs::metadata(&entry.artifact).unwrap().len(), entry.size);

    let current = first.current_fingerprint().unwrap().unwrap();
    assert!(cache.lookup(Backend::Web, &current).is_some());
}

#[tokio::test]
async fn test_cancelled_build_leaves_nothing_behind() {
    let sandbox = Sandbox::new().unwrap();
    sandbox.toolchain.set_slow(true).unwrap();

    let pipeline = pipeline(&sandbox, Backend::Web);
    let request = web_request(&sandbox);
    let cancelled = tokio::time::timeout(Duration::from_millis(500), pipeline.run(&request)).await;
    assert!(cancelled.is_err(), "build should still be running");

    let cache = ArtifactCache::new(sandbox.config.cache_dir());
    assert!(cache.current(Backend::Web).is_none());
    assert!(!sandbox.project_dir().join("build/main.html").exists());

    // The next build starts cold and succeeds
    sandbox.toolchain.set_slow(false).unwrap();
    let result = pipeline.run(&request).await.unwrap();
    assert_eq!(result.library_builds(), 1);
}

#[tokio::test]
async fn test_native_links_installed_library() {
    let sandbox = Sandbox::new().unwrap();
    sandbox.install_native_library().unwrap();

    let request = BuildRequest::new(Backend::Native, sandbox.project_dir());
    let result = pipeline(&sandbox, Backend::Native)
        .run(&request)
        .await
        .unwrap();

    assert_eq!(result.library_builds(), 0);
    assert_eq!(sandbox.toolchain.library_builds(), 0);
    assert!(sandbox.project_dir().join("build/main").is_file());
}

#[tokio::test]
async fn test_single_file_build() {
    let sandbox = Sandbox::new().unwrap();
    let scratch = sandbox.root.join("scratch");
    write(&scratch.join("demo.cpp"), "int main() { return 0; }\n").unwrap();

    let request = BuildRequest::new(Backend::Web, &scratch).with_source(scratch.join("demo.cpp"));
    let result = pipeline(&sandbox, Backend::Web)
        .run(&request)
        .await
        .unwrap();

    assert!(result.target.project.is_none());
    assert_eq!(result.artifact(), scratch.join("build/demo_temp.html"));
    assert!(result.artifact().is_file());
}

#[tokio::test]
async fn test_missing_entry_file() {
    let sandbox = Sandbox::new().unwrap();
    fs::remove_file(sandbox.project_dir().join("lib/main.cpp")).unwrap();

    let err = pipeline(&sandbox, Backend::Web)
        .run(&web_request(&sandbox))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::MissingEntryFile);
    assert!(err.to_string().contains("lib/main.cpp"));
    assert_eq!(sandbox.toolchain.invocations().len(), 0);
}
