//! npsh: a small interactive shell for browsing a 9P2000 file service.

use std::io::Write as _;
use std::time::Duration;

use clap::Parser;
use log::debug;
use ninep::codec::decode_dir;
use ninep::{Client, Dir, Error, Fid, IOHDRSZ, MAXWELEM, NOFID, Result, Session, dm, estr, om};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Parser)]
struct Cli {
    /// host:port of the 9P service
    #[arg(long, default_value = "127.0.0.1:5640")]
    addr: String,

    /// User name presented at attach
    #[arg(long, default_value = "anyone")]
    uname: String,
}

struct Commander {
    session: Client,
    pwd: String,
    pwdfid: Fid,
    rootfid: Fid,
    nextfid: Fid,
}

impl Commander {
    fn fresh_fid(&mut self) -> Fid {
        let fid = self.nextfid;
        self.nextfid += 1;
        fid
    }

    fn absolute(&self, arg: &str) -> String {
        if arg.starts_with('/') {
            arg.to_owned()
        } else if self.pwd == "/" {
            format!("/{}", arg)
        } else {
            format!("{}/{}", self.pwd, arg)
        }
    }

    /// Walk from the root to `path`, chaining walks in
    /// [`MAXWELEM`]-element strides through intermediate fids.
    async fn walk_to(&mut self, path: &str) -> Result<Fid> {
        let names: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect();

        let mut from = self.rootfid;
        let mut walked = 0;
        loop {
            let stride = &names[walked..(walked + MAXWELEM).min(names.len())];
            let target = self.fresh_fid();

            let outcome = self.session.walk(from, target, stride).await;
            if from != self.rootfid {
                let _ = self.session.clunk(from).await;
            }

            let qids = outcome?;
            if qids.len() < stride.len() {
                // partial walk: the target fid was never allocated
                return Err(Error::rerror(estr::NOTFOUND));
            }

            walked += stride.len();
            if walked == names.len() {
                return Ok(target);
            }
            from = target;
        }
    }

    fn read_span(&self, iounit: u32) -> u32 {
        if iounit > 0 {
            iounit
        } else {
            let (msize, _) = self.session.version();
            msize - IOHDRSZ
        }
    }

    async fn cmd_ls(&mut self, args: &[&str]) -> Result<()> {
        let path = self.absolute(args.first().copied().unwrap_or(""));
        let fid = self.walk_to(&path).await?;

        let listing = async {
            let (qid, iounit) = self.session.open(fid, om::READ).await?;
            if !qid.typ.contains(ninep::QidType::DIR) {
                let stat = self.session.stat(fid).await?;
                print_dir(&stat);
                return Ok(());
            }

            let span = self.read_span(iounit);
            let mut offset = 0u64;
            loop {
                let chunk = self.session.read(fid, offset, span).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;

                let mut rd = std::io::Cursor::new(&chunk[..]);
                while (rd.position() as usize) < chunk.len() {
                    print_dir(&decode_dir(&mut rd)?);
                }
            }
            Ok(())
        }
        .await;

        let _ = self.session.clunk(fid).await;
        listing
    }

    async fn cmd_cd(&mut self, args: &[&str]) -> Result<()> {
        let path = self.absolute(args.first().copied().unwrap_or("/"));
        let path = normalize(&path);
        let fid = self.walk_to(&path).await?;

        let _ = self.session.clunk(self.pwdfid).await;
        debug!("cd {} ({})", path, fid);
        self.pwd = path;
        self.pwdfid = fid;
        Ok(())
    }

    async fn cmd_pwd(&mut self, _args: &[&str]) -> Result<()> {
        println!("{}", self.pwd);
        Ok(())
    }

    async fn cmd_cat(&mut self, args: &[&str]) -> Result<()> {
        let Some(arg) = args.first() else {
            return Err(Error::rerror("cat: missing path"));
        };
        let path = self.absolute(arg);
        let fid = self.walk_to(&path).await?;

        let output = async {
            let (_qid, iounit) = self.session.open(fid, om::READ).await?;
            let span = self.read_span(iounit);

            let mut offset = 0u64;
            let stdout = std::io::stdout();
            loop {
                let chunk = self.session.read(fid, offset, span).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;
                stdout.lock().write_all(&chunk)?;
            }
            Ok(())
        }
        .await;

        let _ = self.session.clunk(fid).await;
        output
    }

    async fn cmd_stat(&mut self, args: &[&str]) -> Result<()> {
        let path = self.absolute(args.first().copied().unwrap_or(""));
        let fid = self.walk_to(&path).await?;

        let stat = self.session.stat(fid).await;
        let _ = self.session.clunk(fid).await;
        print_dir(&stat?);
        Ok(())
    }
}

fn print_dir(d: &Dir) {
    let kind = if d.mode & dm::DIR != 0 { 'd' } else { '-' };
    println!(
        "{}{:03o}\t{}\t{}\t{}",
        kind,
        d.mode & 0o777,
        d.length,
        d.mtime,
        d.name
    );
}

/// Collapse `.` and `..` lexically so pwd stays canonical.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for c in path.split('/') {
        match c {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", parts.join("/"))
    }
}

async fn npsh_main(cli: Cli) -> Result<()> {
    let conn = TcpStream::connect(&cli.addr)
        .await
        .map_err(Error::Io)?;

    let session = Client::connect(conn).await?;
    let (msize, version) = session.version();
    println!("9p version {} msize {}", version, msize);

    let mut commander = Commander {
        session,
        pwd: "/".to_owned(),
        pwdfid: 0,
        rootfid: 0,
        nextfid: 1,
    };

    // attach the root, then clone a fid for pwd so either can be clunked
    // independently
    let rootfid = commander.fresh_fid();
    commander.session.attach(rootfid, NOFID, &cli.uname, "/").await?;
    commander.rootfid = rootfid;

    let pwdfid = commander.fresh_fid();
    commander.session.walk(rootfid, pwdfid, &[]).await?;
    commander.pwdfid = pwdfid;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} 9p> ", commander.pwd);
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.map_err(Error::Io)? else {
            return Ok(());
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = fields.split_first() else {
            continue;
        };

        let outcome = match name {
            "ls" => timeout(COMMAND_TIMEOUT, commander.cmd_ls(args)).await,
            "cd" => timeout(COMMAND_TIMEOUT, commander.cmd_cd(args)).await,
            "pwd" => timeout(COMMAND_TIMEOUT, commander.cmd_pwd(args)).await,
            "cat" => timeout(COMMAND_TIMEOUT, commander.cmd_cat(args)).await,
            "stat" => timeout(COMMAND_TIMEOUT, commander.cmd_stat(args)).await,
            "exit" | "quit" => return Ok(()),
            _ => {
                eprintln!("{}: command not implemented", name);
                continue;
            }
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("{}: {}", name, e),
            Err(_) => eprintln!("{}: timed out", name),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = npsh_main(Cli::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
