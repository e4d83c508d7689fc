//! testweavelet - weavelet binary for exercising the envelope end to end
//!
//! The first argument picks a behaviour. Every mode except `silent` prints the
//! process id as its first stdout line, which the envelope treats as the
//! weavelet's first sign of life.
//!
//! ## Modes
//!
//! - `loop`: connect and serve envelope requests until the envelope goes away
//! - `fail`: exit with status 1
//! - `check_file <path>`: exit 0 if the file exists, fail otherwise
//! - `bigprint <n>`: print `n` lines in total, the pid plus `n - 1` lines of 1000 bytes
//! - `writetraces`: send two span batches, then serve
//! - `logentries <n>`: send `n` structured log entries, then serve
//! - `getaddress <name>`: ask the envelope for an address and print the answer
//! - `closecontrol`: close the control pipes without connecting, then keep running
//! - `silent`: never print, never connect

use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use weavelet_envelope::control::Bootstrap;
use weavelet_envelope::{
    ComponentToStart, ExportListenerRequest, GetAddressRequest, LogLevel, Span, WeaveletConn,
};

fn announce() -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", std::process::id())?;
    out.flush()?;
    Ok(())
}

fn connect() -> Result<Arc<WeaveletConn>> {
    let conn = WeaveletConn::from_env().context("connecting to envelope")?;
    Ok(Arc::new(conn))
}

/// Serve on the calling thread; returns once the envelope closes the stream.
fn serve(conn: &WeaveletConn) -> Result<()> {
    conn.serve().context("serving envelope")?;
    Ok(())
}

/// Serve on a background thread so the caller can issue its own requests.
fn serve_in_background(conn: &Arc<WeaveletConn>) -> std::thread::JoinHandle<Result<()>> {
    let conn = conn.clone();
    std::thread::spawn(move || serve(&conn))
}

fn count_arg(args: &[String]) -> Result<usize> {
    args.first()
        .ok_or_else(|| anyhow!("missing line count"))?
        .parse()
        .context("line count must be a number")
}

fn bigprint(n: usize) -> Result<()> {
    announce()?;
    let line = "x".repeat(1000);
    let mut out = std::io::stdout().lock();
    for _ in 1..n {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

fn writetraces() -> Result<()> {
    let conn = connect()?;
    announce()?;
    conn.send_trace_spans(&[Span::new("span1"), Span::new("span2")])?;
    conn.send_trace_spans(&[Span::new("span3"), Span::new("span4")])?;
    serve(&conn)
}

fn logentries(n: usize) -> Result<()> {
    let conn = connect()?;
    announce()?;
    for i in 0..n {
        conn.log("testweavelet", LogLevel::Info, format!("entry {}", i))?;
    }
    serve(&conn)
}

fn getaddress(name: &str) -> Result<()> {
    let conn = connect()?;
    announce()?;
    let server = serve_in_background(&conn);

    let identity = conn.identity().clone();
    conn.start_component(&ComponentToStart {
        app: identity.app.clone(),
        deployment_id: identity.deployment_id.clone(),
        component: format!("{}.Main", identity.app),
        routed: false,
    })?;

    match conn.get_address(&GetAddressRequest {
        name: name.to_string(),
        local_address: String::new(),
    }) {
        Ok(reply) => println!("address: {}", reply.address),
        Err(e) => println!("address error: {}", e),
    }
    match conn.export_listener(&ExportListenerRequest {
        name: name.to_string(),
        address: "127.0.0.1:0".to_string(),
    }) {
        Ok(reply) => println!("proxy: {}", reply.proxy_address),
        Err(e) => println!("proxy error: {}", e),
    }

    server
        .join()
        .map_err(|_| anyhow!("serve thread panicked"))?
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("usage: testweavelet <mode> [args...]"))?;

    match mode.as_str() {
        "loop" => {
            let conn = connect()?;
            announce()?;
            serve(&conn)
        }
        "fail" => {
            announce()?;
            eprintln!("failing on purpose");
            std::process::exit(1);
        }
        "check_file" => {
            announce()?;
            let path = rest.first().ok_or_else(|| anyhow!("missing path"))?;
            std::fs::metadata(path).with_context(|| format!("checking {}", path))?;
            Ok(())
        }
        "bigprint" => bigprint(count_arg(rest)?),
        "writetraces" => writetraces(),
        "logentries" => logentries(count_arg(rest)?),
        "getaddress" => getaddress(rest.first().map(String::as_str).unwrap_or("main")),
        "closecontrol" => {
            announce()?;
            let (reader, writer) = Bootstrap::from_env()?.into_files()?;
            drop((reader, writer));
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        "silent" => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
        other => bail!("unknown mode {:?}", other),
    }
}
