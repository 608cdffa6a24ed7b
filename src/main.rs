#![cfg_attr(target_arch = "riscv32", no_std)]
#![cfg_attr(target_arch = "riscv32", no_main)]

#[cfg(target_arch = "riscv32")]
mod firmware;

#[cfg(target_arch = "riscv32")]
#[esp_hal::main]
fn main() -> ! {
    firmware::run()
}

#[cfg(not(target_arch = "riscv32"))]
fn main() {
    println!(
        "meter-rs {} is ESP32-C3 firmware; build it with `cargo fw`",
        meter_rs::VERSION
    );
}
