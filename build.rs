/// Secrets baked into the firmware at compile time.
const SECRET_VARS: [&str; 5] = [
    "WIFI_SSID",
    "WIFI_PASSWORD",
    "DASHBOARD_TOKEN",
    "TELEGRAM_BOT_TOKEN",
    "TELEGRAM_CHAT_ID",
];

fn main() {
    // Load .env file for WiFi and cloud credentials
    load_env_config();

    // Host builds (unit tests) link normally
    if std::env::var("CARGO_CFG_TARGET_ARCH").as_deref() == Ok("riscv32") {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    for var in SECRET_VARS {
        println!("cargo:rerun-if-env-changed={}", var);
    }

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    // Missing values compile as empty strings; the firmware skips the
    // matching uplink instead of failing the build.
    for var in SECRET_VARS {
        let value = env::var(var)
            .unwrap_or_else(|_| String::new())
            .trim()
            .to_string();

        println!("cargo:rustc-env={}={}", var, value);

        if value.is_empty() {
            println!("cargo:warning={} is empty - feature will be disabled", var);
        } else if var == "WIFI_SSID" {
            println!("cargo:warning=WIFI_SSID configured: {}", value);
        } else {
            println!("cargo:warning={} configured (length: {})", var, value.len());
        }
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_wifi_preempt_enable"
                | "esp_wifi_preempt_yield_task"
                | "esp_wifi_preempt_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-wifi` has no scheduler enabled. Make sure you have the `builtin-scheduler` feature enabled, or that you provide an external scheduler.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
