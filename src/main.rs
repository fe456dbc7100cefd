use clap::Parser;
use ckptconn::conn::FileStatus;
use ckptconn::images::ImageDir;
use ckptconn::options::Options;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

// Global start time for dmesg-style logging
static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "ckptconn")]
#[command(about = "inspect checkpointed connection tables", long_about = None)]
struct Args {
    /// Path to the checkpoint image directory (defaults to the configured
    /// checkpoint directory)
    #[arg(short = 'D', long, value_name = "DIR")]
    image_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Compare checkpointed regular files with what is on disk now
    #[arg(long)]
    check_files: bool,

    /// Print the process identities recorded in the image
    #[arg(long)]
    show_identity: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    START_TIME.get_or_init(Instant::now);

    // Initialize logging with dmesg-style timestamps
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(|buf, record| {
            use std::io::Write;

            let elapsed = START_TIME.get_or_init(Instant::now).elapsed();
            let secs = elapsed.as_secs();
            let micros = elapsed.subsec_micros();

            // Format like dmesg: [  123.456789] LEVEL message
            writeln!(
                buf,
                "[{:5}.{:06}] {} {}",
                secs,
                micros,
                record.level(),
                record.args()
            )
        })
        .init();

    let options = Options::from_env();
    let image_dir = args
        .image_dir
        .or(options.checkpoint_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    log::info!("Image directory: {}", image_dir.display());

    let img_dir = ImageDir::open(&image_dir)?;
    let mut image = img_dir.load_checkpoint()?;

    log::info!(
        "Loaded {} connections from run {}",
        image.entries.len(),
        image.run_id
    );
    image.display()?;

    if args.show_identity {
        println!(
            "this:   {} (generation {})",
            image.this_process, image.this_process.generation
        );
        if image.parent_process.is_null() {
            println!("parent: none");
        } else {
            println!("parent: {}", image.parent_process);
        }
    }

    for entry in &image.entries {
        println!("{:5} {} fds={:?}", entry.conn.kind(), entry.conn.id(), entry.fds);
    }

    if args.check_files {
        let mut stale = 0usize;
        for (path, status) in image.check_files() {
            match status {
                FileStatus::Fresh | FileStatus::Unchecked => {
                    println!("ok      {}", path.display())
                }
                FileStatus::Stale => {
                    stale += 1;
                    println!("stale   {}", path.display());
                }
                FileStatus::Unavailable => {
                    stale += 1;
                    println!("missing {}", path.display());
                }
            }
        }
        if stale > 0 {
            log::warn!("{} checkpointed files changed or disappeared", stale);
        }
    }

    // Rebuilding the table validates descriptor bookkeeping and merges.
    let table = image.into_table()?;
    log::debug!("Connection table rebuilt with {} connections", table.len());

    Ok(())
}
