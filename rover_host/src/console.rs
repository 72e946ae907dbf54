//! Operator console: single-character commands from stdin.

use rover_core::command::Dispatcher;
use rover_core::Core;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Reads stdin byte-by-byte and hands printable keys to the dispatcher.
/// The thread is not joined at shutdown; it dies with the process.
pub fn spawn(core: Arc<Core>, dispatcher: Arc<Dispatcher>) {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1];
            loop {
                if core.shutting_down() {
                    break;
                }
                match stdin.read(&mut buf) {
                    Ok(1) => {
                        if !buf[0].is_ascii_whitespace() {
                            dispatcher.dispatch_console(buf[0]);
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        debug!("console read error: {e}");
                        break;
                    }
                }
            }
        })
        .expect("console thread spawn");
}
