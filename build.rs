fn main() {
    println!("cargo:rerun-if-env-changed=PIKE_LSP_VERSION");
    if let Ok(version) = std::env::var("PIKE_LSP_VERSION") {
        println!("cargo:rustc-env=CARGO_PKG_VERSION={version}");
    }
}
