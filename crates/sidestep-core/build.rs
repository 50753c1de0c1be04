//! Build script for sidestep-core
//!
//! Checks the compiler before building:
//! - Minimum Rust version (`Option::is_some_and` and let-else need 1.70)
//! - Target architecture (the decoders cover x86, x86_64 and PowerPC
//!   debuggees, but the crate itself builds anywhere; other hosts get a note)

const MIN_RUST_VERSION: (u64, u64, u64) = (1, 70, 0);

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match rustc_version::version() {
        Ok(version) => {
            let minimum = rustc_version::Version::new(MIN_RUST_VERSION.0, MIN_RUST_VERSION.1, MIN_RUST_VERSION.2);
            if version < minimum {
                panic!("sidestep-core requires Rust {minimum} or newer, found {version}");
            }
        }
        // Some build environments hide the compiler version.
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if !matches!(arch.as_str(), "x86" | "x86_64" | "powerpc" | "powerpc64") {
        println!("cargo:warning=building sidestep-core on {arch}; native backends are expected on x86 or PowerPC hosts");
    }
}
