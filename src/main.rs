//! Interactive shell over the file system.
//!
//! Thin by design: argument parsing, colour, and host-file transfer live
//! here; everything with an invariant lives in the library.

use std::cmp;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use itertools::Itertools;

use sfs::{Disk, FileSystem, FsError};

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const BLUE: &str = "\x1b[34m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "sfs", about = "A Unix-style file system over a disk image")]
struct Args {
    /// Path of the backing disk image.
    #[arg(long, default_value = sfs::param::DISK_PATH)]
    image: PathBuf,

    /// Size in bytes when creating a fresh image.
    #[arg(long, default_value_t = sfs::param::DISK_SIZE)]
    size: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let disk = match Disk::open(&args.image, args.size) {
        Ok(disk) => disk,
        Err(e) => {
            eprintln!("{RED}Error: {e}{RESET}");
            std::process::exit(1);
        }
    };
    let mut fs = match FileSystem::new(disk) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("{RED}Error: {e}{RESET}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut active = true;
    while active {
        let dir = fs.current_dir().unwrap_or_else(|_| "?".to_string());
        let dir = if dir == "root" { "~".to_string() } else { dir };
        print!("[{}]# ", dir);
        io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let mut parts = line.split_whitespace();
        let cmd = match parts.next() {
            Some(cmd) => cmd,
            None => continue,
        };
        let args: Vec<&str> = parts.collect();
        if let Err(e) = run_command(&mut fs, cmd, &args, &mut active) {
            println!("{RED}Error: {e}{RESET}");
        }
    }
}

fn run_command(
    fs: &mut FileSystem,
    cmd: &str,
    args: &[&str],
    active: &mut bool,
) -> sfs::Result<()> {
    match cmd {
        "help" => help(),
        "exit" => *active = false,
        "format" => {
            println!("Formatting disk...");
            fs.format()?;
            println!("Disk formatted.");
        }
        "init" => fs.init()?,
        "ls" => print_columns(&fs.ls()?),
        "pwd" => println!("{}", fs.pwd()?),
        "cd" => fs.cd(args.first().copied().unwrap_or(""))?,
        "mkdir" => fs.mkdir(req(args, 0)?)?,
        "rm" => fs.rm(req(args, 0)?)?,
        "touch" => fs.touch(req(args, 0)?)?,
        "echo" => println!("{}", args.iter().join(" ")),
        "save" => fs.save()?,
        "fopen" => println!("fd=[{}]", fs.open(req(args, 0)?)?),
        "fclose" => fs.close(parse(req(args, 0)?)?)?,
        "fseek" => fs.seek(parse(req(args, 0)?)?, parse(req(args, 1)?)?)?,
        "fwrite" => {
            let fd = parse(req(args, 0)?)?;
            let data = req(args, 1)?;
            let times: usize = match args.get(2) {
                Some(n) => parse(n)?,
                None => 1,
            };
            for _ in 0..times {
                fs.write(fd, data.as_bytes())?;
            }
        }
        "fread" => {
            let fd = parse(req(args, 0)?)?;
            let mut buf = vec![0; parse::<usize>(req(args, 1)?)?];
            let got = fs.read(fd, &mut buf)?;
            buf.truncate(got);
            println!("{}", String::from_utf8_lossy(&buf));
        }
        "cat" => println!("{}", String::from_utf8_lossy(&fs.cat(req(args, 0)?)?)),
        "flist" => {
            for (fd, name) in fs.flist() {
                println!("[{}] {}", fd, name);
            }
        }
        "upload" => upload(fs, req(args, 0)?, req(args, 1)?)?,
        "download" => download(fs, req(args, 0)?, req(args, 1)?)?,
        _ => println!("Unknown command: {}", cmd),
    }
    Ok(())
}

fn req<'a>(args: &[&'a str], i: usize) -> sfs::Result<&'a str> {
    args.get(i)
        .copied()
        .ok_or(FsError::InvalidArg("missing argument"))
}

fn parse<T: FromStr>(s: &str) -> sfs::Result<T> {
    s.parse()
        .map_err(|_| FsError::InvalidArg("numeric argument expected"))
}

/// Streams a host file into the image through the ordinary write path,
/// creating the target file first when it does not exist.
fn upload(fs: &mut FileSystem, fs_path: &str, host_path: &str) -> sfs::Result<()> {
    let data = std::fs::read(host_path)?;
    if !fs.exist(fs_path) {
        touch_at(fs, fs_path)?;
    }
    let fd = fs.open(fs_path)?;
    let written = fs.write(fd, &data);
    fs.close(fd)?;
    println!("uploaded {} bytes to {}", written?, fs_path);
    Ok(())
}

fn download(fs: &mut FileSystem, fs_path: &str, host_path: &str) -> sfs::Result<()> {
    let size = fs.file_size(fs_path)? as usize;
    let fd = fs.open(fs_path)?;
    let mut buf = vec![0; size];
    let read = fs.read(fd, &mut buf);
    fs.close(fd)?;
    buf.truncate(read?);
    std::fs::write(host_path, &buf)?;
    println!("downloaded {} bytes to {}", buf.len(), host_path);
    Ok(())
}

/// `touch` in the directory named by `path`'s parent, restoring the
/// current directory afterwards.
fn touch_at(fs: &mut FileSystem, path: &str) -> sfs::Result<()> {
    let (parent, name) = match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    };
    if parent.is_empty() {
        return fs.touch(name);
    }
    let here = fs.pwd()?;
    fs.cd(parent)?;
    let created = fs.touch(name);
    fs.cd(&here)?;
    created
}

fn print_columns(names: &[String]) {
    if names.is_empty() {
        return;
    }
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0) + 2;
    let columns = std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(80);
    let per_line = cmp::max(1, columns / width);
    for chunk in &names.iter().chunks(per_line) {
        println!("{}", chunk.map(|n| format!("{:<1$}", n, width)).join(""));
    }
}

fn help() {
    let commands: &[(&str, &str, &str)] = &[
        ("help", "Display available commands", "help"),
        ("exit", "Exit the shell", "exit"),
        ("format", "Format the disk", "format"),
        ("init", "Format and create the standard top-level directories", "init"),
        ("ls", "List directory contents", "ls"),
        ("pwd", "Print working directory", "pwd"),
        ("cd", "Change the current directory", "cd <dir>"),
        ("mkdir", "Create a new directory", "mkdir <dir_name>"),
        ("rm", "Remove a file or empty directory", "rm <name>"),
        ("touch", "Create a new file", "touch <file_name>"),
        ("echo", "Print the message to the console", "echo <message>"),
        ("save", "Flush the file system to disk", "save"),
        ("fopen", "Open a file", "fopen <file_name>"),
        ("fclose", "Close a file", "fclose <file_id>"),
        ("fseek", "Move the file pointer", "fseek <file_id> <offset>"),
        ("fwrite", "Write to a file, optionally repeated", "fwrite <file_id> <data> [times]"),
        ("fread", "Read from a file at the current offset", "fread <file_id> <size>"),
        ("cat", "Print the content of a file", "cat <file_name>"),
        ("flist", "List all opened files", "flist"),
        ("upload", "Copy a host file into the file system", "upload <path> <host_path>"),
        ("download", "Copy a file out to the host", "download <path> <host_path>"),
    ];
    println!("Available commands:");
    for (name, description, usage) in commands {
        println!("- {}{}{}: {}", BLUE, name, RESET, description);
        println!("  Usage: {}{}{}", GREEN, usage, RESET);
    }
}
