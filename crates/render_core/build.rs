// build.rs
// Compiles the forward and postfx GLSL sources to SPIR-V for the Vulkan backend

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: [&str; 2] = ["vert", "frag"];

/// Locate glslc, preferring the Vulkan SDK over PATH
fn find_glslc() -> PathBuf {
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    let Ok(sdk) = env::var("VULKAN_SDK") else {
        return PathBuf::from("glslc");
    };
    let bin = if cfg!(target_os = "windows") { "Bin/glslc.exe" } else { "bin/glslc" };
    Path::new(&sdk).join(bin)
}

fn is_stale(source: &Path, output: &Path) -> bool {
    let modified = |path: &Path| std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(source), modified(output)) {
        (Some(src), Some(dst)) => src > dst,
        _ => true,
    }
}

/// Compile every stage file in `shader_dir` into `<name>.<stage>.spv`
fn compile_shaders(shader_dir: &Path, target_dir: &Path, glslc: &Path) -> usize {
    let entries = match std::fs::read_dir(shader_dir) {
        Ok(entries) => entries,
        Err(err) => {
            println!("cargo:warning=No shader directory at {}: {err}", shader_dir.display());
            return 0;
        }
    };

    let mut compiled = 0;
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        let is_stage = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| STAGES.contains(&ext));
        if !is_stage {
            // .glsl files are include-only
            continue;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let output = target_dir.join(format!("{name}.spv"));
        if !is_stale(&path, &output) {
            continue;
        }

        let status = Command::new(glslc)
            .arg("-I")
            .arg(shader_dir)
            .arg(&path)
            .arg("-o")
            .arg(&output)
            .status();
        match status {
            Ok(status) if status.success() => compiled += 1,
            Ok(status) => println!("cargo:warning=glslc failed for {name} with exit code {:?}", status.code()),
            Err(err) => {
                println!("cargo:warning=Could not run {}: {err}; shaders not compiled", glslc.display());
                return compiled;
            }
        }
    }
    compiled
}

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() || env::var("CARGO_FEATURE_VULKAN").is_err() {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string()));
    let shader_dir = manifest_dir.join("shaders");
    let target_dir = manifest_dir.join("../../target/shaders");
    if let Err(err) = std::fs::create_dir_all(&target_dir) {
        println!("cargo:warning=Failed to create {}: {err}", target_dir.display());
        return;
    }

    let compiled = compile_shaders(&shader_dir, &target_dir, &find_glslc());
    eprintln!("info: compiled {compiled} shader(s) into {}", target_dir.display());
}
