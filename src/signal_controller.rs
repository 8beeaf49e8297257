use std::{io, thread};

use tokio::signal::unix::{signal, SignalKind};

use crate::common::ShutdownToken;

const SIGABRT: i32 = 6;

/**
 * Requests shutdown on SIGINT, SIGQUIT, SIGTERM or SIGABRT. The handlers are
 * registered before this returns; a small runtime on its own thread waits for
 * them for the rest of the process.
 */
pub(crate) fn install_shutdown_handler(shutdown: ShutdownToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (mut interrupt, mut quit, mut terminate, mut abort) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::quit())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::from_raw(SIGABRT))?,
        )
    };

    thread::Builder::new()
        .name(String::from("signals"))
        .spawn(move || {
            runtime.block_on(async {
                loop {
                    let name = tokio::select! {
                        _ = interrupt.recv() => "SIGINT",
                        _ = quit.recv() => "SIGQUIT",
                        _ = terminate.recv() => "SIGTERM",
                        _ = abort.recv() => "SIGABRT",
                    };
                    log::warn!("Received {}. Shutting down.", name);
                    shutdown.request();
                }
            })
        })?;
    Ok(())
}
