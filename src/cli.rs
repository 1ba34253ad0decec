//! Interactive command shell.
//!
//! Reads commands from stdin and renders read-only views of engine and
//! tracker state. No protocol logic lives here.

use std::io::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::engine::Engine;

const PROMPT: &str = "urtorrent> ";

/// Runs the shell until `quit` or end of input.
pub async fn run(engine: Arc<Engine>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{PROMPT}");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };

        match line.trim() {
            "" => {}
            "quit" => return Ok(()),
            "metainfo" => show_metainfo(&engine),
            "announce" => do_announce(&engine).await,
            "trackerinfo" => show_trackerinfo(&engine),
            "show" => show_peers(&engine),
            "status" => show_status(&engine),
            _ => help(),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn show_metainfo(engine: &Arc<Engine>) {
    let meta = &engine.meta;
    let agent = &engine.agent;

    println!("\tIP/port\t: {}", agent.local_addr());
    println!("\tID\t: {}", engine.peer_id);
    println!("\tmetainfo file : {}", meta.source.display());
    println!("\tinfo hash\t: {}", hex(&meta.info_hash));
    println!("\tfile name\t: {}", meta.name);
    println!("\tpiece length\t: {}", meta.piece_length);
    println!(
        "\tfile size\t: {} ({} * [piece length] + {})",
        meta.file_size,
        meta.file_size / meta.piece_length as u64,
        meta.file_size % meta.piece_length as u64,
    );
    println!("\tannounce URL\t: {}", meta.announce);
    println!("\tpieces' hashes :");

    let width = meta.piece_count().to_string().len().max(5);
    for (index, piece_hash) in meta.piece_hashes.iter().enumerate() {
        println!("\t{:>width$}:  {}", index, hex(piece_hash));
    }
}

async fn do_announce(engine: &Arc<Engine>) {
    match engine.agent.announce_now().await {
        Ok(_) => {
            println!("\tTracker responded:");
            show_trackerinfo(engine);
        }
        Err(err) => eprintln!("announce failed: {err}"),
    }
}

fn show_trackerinfo(engine: &Arc<Engine>) {
    let agent = &engine.agent;
    let Some(resp) = agent.last_response() else {
        println!("\tno tracker response yet");
        return;
    };

    println!("\tcomplete | downloaded | incomplete | interval | min interval |");
    println!("\t{}", "-".repeat(64));
    println!(
        "\t{:<8} | {:<10} | {:<10} | {:<8} | {:<12} |",
        resp.complete.map_or_else(|| "-".into(), |n| n.to_string()),
        agent.downloaded(),
        resp.incomplete.map_or_else(|| "-".into(), |n| n.to_string()),
        resp.interval,
        resp.min_interval.map_or_else(|| "-".into(), |n| n.to_string()),
    );

    println!("\tPeer List (self included):");
    println!("\t\tIP               | Port");
    println!("\t\t{}", "-".repeat(29));
    for peer in &resp.peers {
        println!("\t\t{:<16} | {}", peer.ip(), peer.port());
    }
}

fn show_peers(engine: &Arc<Engine>) {
    let rows = engine.peer_rows();
    let width = engine.meta.piece_count().max(8) as usize;

    println!(
        "\t\tID | IP address      | Status | {:<width$} | Down/s    | Up/s      |",
        "Bitfield"
    );
    println!("\t\t{}", "-".repeat(width + 58));

    for (id, row) in rows.iter().enumerate() {
        let status = format!(
            "{}{}{}{}",
            row.am_choking as u8,
            row.am_interested as u8,
            row.peer_choking as u8,
            row.peer_interested as u8,
        );
        println!(
            "\t\t{:<2} | {:<15} | {}   | {:<width$} | {:<9.1} | {:<9.1} |",
            id,
            row.addr.ip(),
            status,
            row.bitfield,
            row.down_rate,
            row.up_rate,
        );
    }
}

fn show_status(engine: &Arc<Engine>) {
    let agent = &engine.agent;
    let width = engine.meta.piece_count().max(12) as usize;

    println!(
        "\t\tDownloaded | Uploaded |  Left | {:<width$}",
        "My bit field"
    );
    println!("\t\t{}", "-".repeat(width + 30));
    println!(
        "\t\t{:<10} | {:<8} | {:<5} | {}",
        agent.downloaded(),
        agent.uploaded(),
        agent.left(),
        engine.bitfield_string(),
    );
}

fn help() {
    println!("NOT VALID: Please try any of the following instead");
    println!("\tmetainfo : show all info about the given metainfo file");
    println!("\tannounce : send a GET request to the tracker and display the response");
    println!("\ttrackerinfo : display the output of the last successful tracker response");
    println!("\tshow : display the list of our current peers and some stats about them");
    println!("\tstatus : print out the status of our download");
}
