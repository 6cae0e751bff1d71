use time::macros::format_description;

fn main() {
    let stamp_fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");

    // Reproducible builds can pin the stamp from the environment.
    let stamp = std::env::var("RENDER_BUILD_STAMP").unwrap_or_else(|_| {
        time::OffsetDateTime::now_utc()
            .format(stamp_fmt)
            .unwrap_or_else(|_| "unknown".to_string())
    });

    println!("cargo:rerun-if-env-changed=RENDER_BUILD_STAMP");
    println!("cargo:rustc-env=RENDER_BUILD_STAMP={}", stamp);
}
