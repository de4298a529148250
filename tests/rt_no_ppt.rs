use std::fs;
use std::path::Path;

/// Modules that only run on the audio thread must not reach for the PPT log
/// or `tracing`: both lock and allocate.
#[test]
fn rt_modules_do_not_log_or_assert() {
    for module in ["rt.rs", "traverser.rs", "nodes.rs", "buffer.rs", "invariant_rt.rs"] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join(module);
        let src = fs::read_to_string(&path).expect("failed to read module source");
        assert!(
            !src.contains("assert_invariant("),
            "{module} calls assert_invariant; signal through invariant_rt instead"
        );
        assert!(!src.contains("tracing::"), "{module} logs from the audio thread");
    }
}

/// `run_block` is the body of the audio callback.
#[test]
fn engine_block_body_does_not_log_or_assert() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join("engine.rs");
    let src = fs::read_to_string(path).expect("failed to read engine.rs");
    let start = src.find("fn run_block(").expect("run_block not found");
    let body = &src[start..];
    let end = body.find("\n}\n").expect("run_block has no end");
    let body = &body[..end];
    assert!(!body.contains("assert_invariant("));
    assert!(!body.contains("tracing::"));
}
