/// CLI utilities for consistent output formatting
use std::io::IsTerminal;

/// Prefix for messages on stderr, bright cyan on a TTY
pub fn seamless_prefix() -> &'static str {
    if std::io::stderr().is_terminal() {
        "\x1b[96m[seamless]\x1b[0m"
    } else {
        "[seamless]"
    }
}
