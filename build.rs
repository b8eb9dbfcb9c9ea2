fn main() {
    let date = time_now();
    println!("cargo:rustc-env=BUILD_DATE={date}");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}

fn time_now() -> String {
    // SOURCE_DATE_EPOCH keeps release builds reproducible
    let mut cmd = std::process::Command::new("date");
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        cmd.args(["-d", &format!("@{epoch}")]);
    }
    cmd.arg("+%Y-%m-%d");

    match cmd.output() {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => "unknown".to_string(),
    }
}
