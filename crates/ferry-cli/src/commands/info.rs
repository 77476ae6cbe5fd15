//! `ferry info`: configuration, translator and registered modules.

use super::Session;
use crate::output::StyledOutput;
use ferry_runtime::BridgeConfig;
use termcolor::ColorChoice;

pub fn execute(config: &BridgeConfig, choice: ColorChoice) -> anyhow::Result<()> {
    let session = Session::open(config)?;
    let bridge = &session.bridge;
    let memory = bridge.memory();
    let mut out = StyledOutput::new(choice);

    out.bold(&format!("ferry v{}", env!("CARGO_PKG_VERSION")));
    out.newline();
    out.newline();

    out.field(
        "Platform",
        format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
    );
    out.field(
        "Guest",
        format!(
            "{} bit, {} translation",
            bridge.context().bits().bits(),
            config.guest.translation
        ),
    );
    out.field("Translator", bridge.translator().name());
    out.field(
        "Arena",
        format!("{:#x} ({} bytes)", memory.guest_base(), memory.size()),
    );
    out.field("Log level", &config.log.level);

    out.newline();
    out.bold("Modules:");
    out.newline();
    for table in bridge.registry().tables() {
        out.plain(&format!(
            "  {:>3}  {:<8} {} operations\n",
            table.module().0,
            table.name(),
            table.len()
        ));
    }

    out.newline();
    out.bold("Environment:");
    out.newline();
    for var in ["FERRY_LOG", "NO_COLOR"] {
        match std::env::var(var) {
            Ok(value) => out.plain(&format!("  {} = {}\n", var, value)),
            Err(_) => out.plain(&format!("  {} = (default)\n", var)),
        }
    }
    out.flush();
    Ok(())
}
