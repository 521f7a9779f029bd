fn main() {
    for (from, to) in [("TARGET", "MVLC_BUILD_TARGET"), ("PROFILE", "MVLC_BUILD_PROFILE")] {
        if let Ok(value) = std::env::var(from) {
            println!("cargo:rustc-env={to}={value}");
        }
        println!("cargo:rerun-if-env-changed={from}");
    }
}
