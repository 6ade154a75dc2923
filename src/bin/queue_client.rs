use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use queue_raft::message::{ClientOutcome, ClientReply, ClientRequest, Envelope, Track, TrackId};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of any node in the cluster; a non-leader reply is followed
    /// automatically until the request reaches the leader.
    #[arg(short, long)]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a track to the queue
    Add {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
    },
    /// Remove a track from the queue
    Remove {
        #[arg(long)]
        id: u64,
    },
    /// Print the current queue
    Get,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let request = match cli.command {
        Commands::Add { id, title, artist } => ClientRequest::AddTrack(Track { id, title, artist }),
        Commands::Remove { id } => ClientRequest::RemoveTrack(TrackId(id)),
        Commands::Get => ClientRequest::GetQueue,
    };

    let reply = send_request(cli.addr, request)?;
    match reply.outcome {
        ClientOutcome::Queued => println!("committed."),
        ClientOutcome::QueuedButNotCommitted => println!("accepted but not committed within the client timeout."),
        ClientOutcome::Forwarded => println!("ok."),
        ClientOutcome::NoLeader => println!("no leader is currently known."),
    }
    println!("queue: {:#?}", reply.queue);

    Ok(())
}

fn send_request(addr: SocketAddr, request: ClientRequest) -> Result<ClientReply> {
    use std::io::{Read, Write};

    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5)).with_context(|| format!("connecting to {addr}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let envelope = Envelope::Client { body: request };
    let body = serde_json::to_vec(&envelope)?;
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;

    match serde_json::from_slice(&buf)? {
        Envelope::ClientReply { body } => Ok(body),
        _ => bail!("unexpected reply shape from {addr}"),
    }
}
