use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    let rustc = env::var_os("RUSTC").unwrap_or_else(|| "rustc".into());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .unwrap_or_default();

    let mut out_path: PathBuf = env::var_os("OUT_DIR").unwrap().into();
    out_path.push("compiler.rs");
    let mut file = File::create(out_path).unwrap();
    write!(file, r#"const COMPILER_VERSION: &str = {:?};"#, version.trim()).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
