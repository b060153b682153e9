//! The in-game command channel.
//!
//! Downstream speech starting with '%' is interpreted here and never
//! forwarded upstream. Replies go only to the client that asked, through
//! the synthesized console channel.

use log::info;

use crate::downstream::ClientId;
use crate::session::Session;

pub const COMMAND_PREFIX: char = '%';

pub fn handle_command(session: &mut Session, origin: ClientId, line: &str) {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        session.speak_console_to(origin, "empty command, try %help");
        return;
    };

    info!("client {origin} command: %{word}");

    match word {
        "help" => {
            session.speak_console_to(origin, "commands: %help %sessions %reconnect %autoreconnect [on|off]");
        }
        "sessions" => {
            let rows = session.registry().snapshot();
            session.speak_console_to(origin, &format!("{} session(s)", rows.len()));
            for row in rows {
                let link = if row.upstream_live { "up" } else { "down" };
                session.speak_console_to(
                    origin,
                    &format!(
                        "{} server {} character {}: link {}, {} client(s), autoreconnect {}",
                        row.key.username,
                        row.key.server_index,
                        row.key.character_index,
                        link,
                        row.active_clients,
                        if row.autoreconnect { "on" } else { "off" },
                    ),
                );
            }
        }
        "reconnect" => {
            session.speak_console_to(origin, "rebuilding upstream link");
            session.request_reconnect();
        }
        "autoreconnect" => match parts.next() {
            Some("on") => {
                session.set_autoreconnect(true);
                session.speak_console_to(origin, "autoreconnect on");
            }
            Some("off") => {
                session.set_autoreconnect(false);
                session.speak_console_to(origin, "autoreconnect off");
            }
            None => {
                let state = if session.autoreconnect() { "on" } else { "off" };
                session.speak_console_to(origin, &format!("autoreconnect is {state}"));
            }
            Some(other) => {
                session.speak_console_to(origin, &format!("autoreconnect: unknown argument '{other}'"));
            }
        },
        other => {
            session.speak_console_to(origin, &format!("unknown command '%{other}', try %help"));
        }
    }
}
