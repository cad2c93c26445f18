use std::{
    fs,
    io::{Seek, SeekFrom, Write},
    path::Path,
    process,
};

use clap::{App, Arg};

use torrly::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    torrent::{PieceReceiver, Torrent},
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("torrly")
        .version(clap::crate_version!())
        .about("A simple BitTorrent leech client")
        .arg(
            Arg::with_name("torrent")
                .value_name("TORRENT")
                .required(true)
                .help("Path to the .torrent file"),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("FILE")
                .takes_value(true)
                .help("Where to write the download (defaults to the name in the torrent)"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .help("The port reported to the tracker"),
        )
        .get_matches();

    let torrent_path = matches.value_of("torrent").unwrap();
    let output = matches.value_of("output").map(str::to_string);
    let port = match matches.value_of("port").map(str::parse::<u16>) {
        None => None,
        Some(Ok(port)) => Some(port),
        Some(Err(_)) => {
            eprintln!("error: the port must be a number between 0 and 65535");
            process::exit(2);
        }
    };

    if let Err(e) = run(torrent_path, output, port).await {
        log::error!("Download failed: {}", e);
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn run(
    torrent_path: &str,
    output: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let path = Path::new(torrent_path);
    if path.extension().and_then(|e| e.to_str()) != Some("torrent") {
        return Err(Error::InvalidMetainfo("not a .torrent file"));
    }

    let buf = fs::read(path)?;
    let metainfo = Metainfo::from_bytes(&buf)?;
    print_summary(&metainfo)?;

    let mut conf = Conf::default();
    if let Some(port) = port {
        conf.listen_port = port;
    }

    let output_path = output.unwrap_or_else(|| metainfo.info.name.clone());
    let piece_len = metainfo.info.piece_length as u64;
    let total_len = metainfo.info.length;

    let (mut torrent, piece_port) = Torrent::new(&metainfo, conf)?;

    // drive the swarm and the file sink together; the sink finishes once
    // every byte is accounted for or the download stops delivering
    let (result, sink_result) = tokio::join!(
        torrent.start(),
        write_pieces(piece_port, &output_path, piece_len, total_len),
    );
    result?;
    sink_result?;

    println!("Downloaded {} to {}", metainfo.info.name, output_path);
    Ok(())
}

/// Writes verified pieces into the output file at `index * piece_length` as
/// they arrive.
async fn write_pieces(
    mut piece_port: PieceReceiver,
    output_path: &str,
    piece_len: u64,
    total_len: u64,
) -> Result<()> {
    let mut file = fs::File::create(output_path)?;
    let mut written = 0u64;
    while written < total_len {
        match piece_port.recv().await {
            Some(piece) => {
                file.seek(SeekFrom::Start(piece.index as u64 * piece_len))?;
                file.write_all(&piece.data)?;
                written += piece.data.len() as u64;
            }
            // the download ended early; the torrent reports why
            None => break,
        }
    }
    file.flush()?;
    Ok(())
}

fn print_summary(metainfo: &Metainfo) -> Result<()> {
    let info_hash = metainfo.create_info_hash()?;
    println!("Tracker URL:  {}", metainfo.announce);
    println!("File name:    {}", metainfo.info.name);
    println!("File size:    {}", format_size(metainfo.info.length));
    println!("Piece length: {} KiB", metainfo.info.piece_length / 1024);
    println!("Pieces:       {}", metainfo.piece_count());
    println!("Info hash:    {}", hex::encode(&info_hash));
    Ok(())
}

fn format_size(len: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if len >= 1024 * MIB {
        format!("{:.2} GiB", len as f64 / (1024 * MIB) as f64)
    } else if len >= MIB {
        format!("{:.2} MiB", len as f64 / MIB as f64)
    } else {
        format!("{} KiB", len / 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10 * 1024), "10 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
