//! User interaction seam: questions and warnings raised by the engine are
//! routed through a trait the caller implements.

use crate::error::Error;
use crate::error::Result;
use libc::tcgetattr;
use libc::tcsetattr;
use libc::termios;
use libc::ECHO;
use libc::ECHOE;
use libc::ICANON;
use libc::STDIN_FILENO;
use libc::TCSANOW;
use libc::VMIN;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::Mutex;

/// Shared handle on the interaction seam. Questions may be raised from
/// worker threads, so implementations are thread-safe.
pub type Ui = Arc<dyn UserInteraction + Send + Sync>;

/// Callbacks the engine uses to talk to whoever drives it.
pub trait UserInteraction {
    /// Shows an informational message.
    fn message(&self, text: &str);

    /// Asks a yes/no question. Returning false means "no".
    fn pause(&self, text: &str) -> bool;

    /// Asks for a string, echoing the input when `echo` is set.
    fn get_string(&self, prompt: &str, echo: bool) -> Result<String>;

    /// Asks for a secret (passphrase), never echoed.
    fn get_secret(&self, prompt: &str) -> Result<String> {
        self.get_string(prompt, false)
    }

    /// Asks a yes/no question and turns "no" into a user-abort error.
    fn pause_or_abort(&self, text: &str) -> Result<()> {
        if self.pause(text) {
            Ok(())
        } else {
            Err(Error::UserAbort(text.to_string()))
        }
    }
}

/// Terminal implementation reading answers from standard input.
pub struct TermInteraction;

/// Reads one line from standard input, hiding the input when `hidden`.
fn term_read_line(prompt: &str, hidden: bool) -> Option<String> {
    // Save termios state
    let saved_termios = unsafe {
        let mut t: termios = MaybeUninit::zeroed().assume_init();
        tcgetattr(STDIN_FILENO, &mut t);
        t
    };
    if hidden {
        let mut termios = saved_termios;
        termios.c_lflag &= !(ICANON | ECHO | ECHOE);
        termios.c_cc[VMIN] = 1;
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &termios);
        }
    }
    print!("{prompt}");
    let _ = io::stdout().flush();
    let input = io::stdin().lock().lines().next()?.unwrap_or(String::new());
    if hidden {
        println!();
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &saved_termios);
        }
    }
    Some(input)
}

impl UserInteraction for TermInteraction {
    fn message(&self, text: &str) {
        eprintln!("{text}");
    }

    fn pause(&self, text: &str) -> bool {
        term_read_line(&format!("{text} [y/N] "), false)
            .map(|s| s.to_lowercase() == "y")
            .unwrap_or(false)
    }

    fn get_string(&self, prompt: &str, echo: bool) -> Result<String> {
        term_read_line(prompt, !echo)
            .ok_or_else(|| Error::UserAbort("no input available".to_string()))
    }
}

/// Scripted implementation: answers every question from preset values and
/// records messages. Used where no terminal is available.
#[derive(Default)]
pub struct ScriptedInteraction {
    /// Answer returned by `pause`.
    pub pause_answer: bool,
    /// Answer returned by `get_string` and `get_secret`.
    pub string_answer: String,
    messages: Mutex<Vec<String>>,
}

impl ScriptedInteraction {
    pub fn new(pause_answer: bool, string_answer: &str) -> Self {
        Self {
            pause_answer,
            string_answer: string_answer.to_string(),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Messages recorded so far.
    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(m) => m.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl UserInteraction for ScriptedInteraction {
    fn message(&self, text: &str) {
        if let Ok(mut m) = self.messages.lock() {
            m.push(text.to_string());
        }
    }

    fn pause(&self, _text: &str) -> bool {
        self.pause_answer
    }

    fn get_string(&self, _prompt: &str, _echo: bool) -> Result<String> {
        Ok(self.string_answer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_answers() {
        let ui = ScriptedInteraction::new(false, "answer");
        assert!(!ui.pause("continue?"));
        assert!(ui.pause_or_abort("continue?").is_err());
        assert_eq!(ui.get_string("name: ", true).unwrap(), "answer");
        ui.message("warned");
        assert_eq!(ui.messages(), vec!["warned".to_string()]);
    }
}
