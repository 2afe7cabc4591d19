//! Line commands of the `splitview-tab` shell.

use splitview_core::{DragData, MIME_TEXT_PLAIN, MIME_URI_LIST};

use crate::{
    config::{MouseCombo, ShortcutConfig},
    runtime::TabCommand,
};

pub const HELP: &str = "\
commands:
  source | join | target          take a role
  disconnect | revoke | reset     leave a group / leave quietly / reset profile
  mute                            toggle the sound guard
  navigate <url>                  this page moved to <url>
  link <url>                      click a link (a Source sends it to its Targets)
  drop-link <url>                 drop a link on the status dot (local only)
  drag                            print the drag payload of this tab
  drop <text>                     drop text/plain data on this page
  pair-request                    broadcast a pairing request (Source only)
  visible on|off                  page visibility
  shortcuts <source> <target>     e.g. shortcuts ctrl+middle alt+middle
  click <combo>                   mouse down, e.g. click ctrl+middle
  status | help | quit";

#[derive(Debug)]
pub enum ShellInput {
    Command(TabCommand),
    Drag,
    Status,
    Help,
    Quit,
}

/// `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<ShellInput>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let input = match verb {
        "source" => ShellInput::Command(TabCommand::CreateSource),
        "join" => ShellInput::Command(TabCommand::JoinAsSource),
        "target" => ShellInput::Command(TabCommand::CreateTarget),
        "disconnect" => ShellInput::Command(TabCommand::Disconnect),
        "revoke" => ShellInput::Command(TabCommand::Revoke),
        "reset" => ShellInput::Command(TabCommand::ResetAll),
        "mute" => ShellInput::Command(TabCommand::ToggleMute),
        "navigate" => ShellInput::Command(TabCommand::Navigated(argument(verb, rest)?)),
        "link" => ShellInput::Command(TabCommand::FollowLink(argument(verb, rest)?)),
        "drop-link" => {
            let mut data = DragData::new();
            data.insert(MIME_URI_LIST.to_owned(), argument(verb, rest)?);
            ShellInput::Command(TabCommand::DropLink(data))
        }
        "drop" => {
            let mut data = DragData::new();
            data.insert(MIME_TEXT_PLAIN.to_owned(), argument(verb, rest)?);
            ShellInput::Command(TabCommand::Drop(data))
        }
        "drag" => ShellInput::Drag,
        "pair-request" => ShellInput::Command(TabCommand::RequestPairing),
        "visible" => match rest {
            "on" => ShellInput::Command(TabCommand::SetVisible(true)),
            "off" => ShellInput::Command(TabCommand::SetVisible(false)),
            _ => return Err("usage: visible on|off".to_owned()),
        },
        "shortcuts" => {
            let mut combos = rest.split_whitespace();
            let (Some(source), Some(target), None) = (combos.next(), combos.next(), combos.next())
            else {
                return Err("usage: shortcuts <source-combo> <target-combo>".to_owned());
            };
            ShellInput::Command(TabCommand::ConfigureShortcuts(ShortcutConfig {
                source: source.parse::<MouseCombo>()?,
                target: target.parse::<MouseCombo>()?,
            }))
        }
        "click" => ShellInput::Command(TabCommand::MouseDown(
            argument(verb, rest)?.parse::<MouseCombo>()?,
        )),
        "status" => ShellInput::Status,
        "help" => ShellInput::Help,
        "quit" | "exit" => ShellInput::Quit,
        other => return Err(format!("unknown command '{other}' (try help)")),
    };
    Ok(Some(input))
}

fn argument(verb: &str, rest: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(format!("{verb} needs an argument"))
    } else {
        Ok(rest.to_owned())
    }
}
