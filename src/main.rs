use std::process::ExitCode;

fn main() -> ExitCode {
    certbinder_lib::run()
}
