//! Logging backend which writes to a file next to the game executable.

use chrono::Local;
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{mpsc, Mutex},
};

struct Message {
    module: String,
    level: Level,
    string: String,
    time: String,
}

impl Message {
    fn write_to_file(&self, file: &mut File) {
        let level_name = match self.level {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };

        //      [date time] [module] [level] Text
        let _ = file.write_fmt(format_args!(
            "[{}] [{}] [{}] {}\n",
            self.time, self.module, level_name, self.string
        ));
    }
}

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let module_path = match record.module_path() {
            Some(path) => path,
            None => return,
        };

        let message = Message {
            module: module_path
                .split("::")
                .last()
                .unwrap_or("unknown")
                .to_string(),
            level: record.level(),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(sender) = MSG_SENDER.get() {
            if let Ok(sender) = sender.lock() {
                let _ = sender.send(message);
            }
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Message>>> = OnceCell::new();

/// Returns the path of `name` placed next to the game executable, or just `name` if the
/// executable's location is unknown.
fn file_beside_game(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn panic_hook(info: &std::panic::PanicInfo) {
    let backtrace = std::backtrace::Backtrace::force_capture();

    let info_dump = format!(
        "The sound fix panicked. Details below.

Message: {info}
Time: {}
Backtrace:
{backtrace}",
        Local::now()
    );

    log::error!("{info_dump}");

    let _ = std::fs::write(file_beside_game("dsound-fix-panic.txt"), info_dump);

    // Unwinding into the game's frames is not survivable, so don't try.
    std::process::abort();
}

pub fn init() {
    std::panic::set_hook(Box::new(panic_hook));

    if log::set_logger(&LOGGER).is_err() {
        return;
    }

    log::set_max_level(log::LevelFilter::max());

    // If the log file can't be created we still keep the logger installed; messages just
    // go nowhere, which is the best an injected library can do.
    let mut file = match File::create(file_beside_game("dsound-fix.log")) {
        Ok(file) => file,
        Err(_) => return,
    };

    let (sender, receiver) = mpsc::channel();

    let _ = MSG_SENDER.set(Mutex::new(sender));

    // Receive log messages on a background thread so writes never stall game code.
    std::thread::spawn(move || {
        while let Ok(msg) = receiver.recv() {
            msg.write_to_file(&mut file);
        }
    });
}
