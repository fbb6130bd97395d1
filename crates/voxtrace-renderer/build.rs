use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// Ray tracing stages, named `<stage name>.<glslc stage>`.
const RT_SHADERS: &[(&str, &str)] = &[
    ("raygen.rgen", "rgen"),
    ("miss.rmiss", "rmiss"),
    ("shadow.rmiss", "rmiss"),
    ("closesthit_triangles.rchit", "rchit"),
    ("closesthit_volume.rchit", "rchit"),
    ("intersection_volume.rint", "rint"),
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    let Ok(dest) = env::var("OUT_DIR") else {
        return;
    };
    let shader_dir = Path::new("shaders");
    if !shader_dir.exists() {
        return;
    }
    for (filename, _) in RT_SHADERS {
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }
    println!("cargo:rerun-if-changed=shaders/common.glsl");

    // ========================================================================
    // SPIR-V compilation (glslc from the Vulkan SDK)
    // ========================================================================
    // Vulkan 1.2 is enough for buffer device address and the KHR ray tracing
    // extensions. Without glslc the library still builds; SPIR-V is then
    // expected under VOXTRACE_SHADER_DIR at runtime.
    let Some(glslc) = find_glslc() else {
        println!("cargo:warning=glslc not found; ray tracing shaders were not compiled. Install the Vulkan SDK or set VOXTRACE_SHADER_DIR.");
        return;
    };

    let spirv_dir = Path::new(&dest).join("spirv");
    if let Err(e) = fs::create_dir_all(&spirv_dir) {
        println!("cargo:warning=cannot create {}: {e}", spirv_dir.display());
        return;
    }

    let mut failed = Vec::new();
    for (filename, stage) in RT_SHADERS {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(format!("{filename}.spv"));
        if !compile_shader(&glslc, &src_path, &spv_path, stage, filename) {
            failed.push(*filename);
        }
    }

    if failed.is_empty() {
        println!("cargo:rustc-env=VOXTRACE_BUILD_SPIRV_DIR={}", spirv_dir.display());
    } else {
        println!("cargo:warning=shaders failed to compile: {}", failed.join(", "));
    }
}

/// Compile one shader to SPIR-V. Problems are reported as cargo warnings.
fn compile_shader(glslc: &Path, src_path: &Path, spv_path: &Path, stage: &str, filename: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.2", "-O", "-I", "shaders", "-o"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if result.status.success() {
                if !stderr.is_empty() {
                    println!("cargo:warning=glslc {filename}: {stderr}");
                }
                true
            } else {
                println!("cargo:warning=glslc FAILED {filename}: {stderr}");
                false
            }
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// glslc on PATH, then under VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = PathBuf::from(env::var("VULKAN_SDK").ok()?);
    ["Bin/glslc.exe", "bin/glslc"]
        .iter()
        .map(|rel| sdk.join(rel))
        .find(|path| path.exists())
}
