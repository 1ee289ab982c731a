// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn device_arg() -> Arg {
    Arg::new("device")
        .short('D')
        .long("device")
        .value_name("NAME")
        .required(true)
        .help("Registered device name")
}

fn build_cli() -> Command {
    Command::new("tabsync")
        .version(env!("CARGO_PKG_VERSION"))
        .author("tabsync Contributors")
        .about("Package installer and backup manager for e-paper tablets")
        .subcommand_required(false)
        .arg(
            Arg::new("db_path")
                .short('d')
                .long("db-path")
                .value_name("PATH")
                .global(true)
                .help("Database path"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .value_name("DIR")
                .global(true)
                .env("PREFIX")
                .help("Install prefix on the device"),
        )
        .subcommand(Command::new("init").about("Initialize the tabsync database"))
        .subcommand(
            Command::new("device-add")
                .about("Register a device")
                .arg(Arg::new("name").required(true).help("Device name"))
                .arg(Arg::new("host").long("host").help("SSH host name or address"))
                .arg(Arg::new("port").long("port"))
                .arg(Arg::new("user").long("user"))
                .arg(Arg::new("key").long("key").help("Private key for SSH authentication"))
                .arg(Arg::new("local").long("local").help("Host directory standing in for the device"))
                .arg(
                    Arg::new("root")
                        .long("root")
                        .default_value("/home/root/.local/share/remarkable/xochitl")
                        .help("Device directory captured by backups"),
                ),
        )
        .subcommand(Command::new("device-list").about("List registered devices"))
        .subcommand(
            Command::new("device-remove")
                .about("Forget a device")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("pack")
                .about("Build a package archive from a staged directory")
                .arg(Arg::new("dir").required(true))
                .arg(Arg::new("output").short('o').long("output").required(true))
                .arg(Arg::new("name").long("name").required(true))
                .arg(Arg::new("version").long("version").required(true))
                .arg(Arg::new("info").long("info").help("Free-form description stored in INFO"))
                .arg(
                    Arg::new("compression")
                        .long("compression")
                        .value_parser(["none", "gzip", "zstd", "xz"])
                        .default_value("none"),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Print the INFO section of an archive")
                .arg(Arg::new("archive").required(true)),
        )
        .subcommand(
            Command::new("manifest")
                .about("Print the manifest of an archive under the prefix")
                .arg(Arg::new("archive").required(true)),
        )
        .subcommand(
            Command::new("install")
                .about("Install a package archive onto a device")
                .arg(Arg::new("archive").required(true))
                .arg(device_arg())
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Take over files owned by other packages"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed package")
                .arg(Arg::new("package").required(true))
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Remove files left behind by an interrupted install")
                .arg(Arg::new("archive").required(true))
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("query")
                .about("List packages installed on a device")
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("Show changeset history")
                .arg(device_arg().required(false))
                .arg(
                    Arg::new("id")
                        .long("id")
                        .conflicts_with("device")
                        .help("Show a single changeset"),
                ),
        )
        .subcommand(
            Command::new("backup")
                .about("Capture a snapshot of the device's managed root")
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("restore")
                .about("Write a snapshot back onto a device")
                .arg(Arg::new("snapshot").required(true))
                .arg(device_arg())
                .arg(Arg::new("subtree").long("subtree").help("Restore only this subtree"))
                .arg(
                    Arg::new("any-model")
                        .long("any-model")
                        .action(ArgAction::SetTrue)
                        .help("Restore even if the snapshot was taken on another hardware model"),
                ),
        )
        .subcommand(
            Command::new("snapshots")
                .about("List snapshots, newest first")
                .arg(device_arg().required(false)),
        )
        .subcommand(
            Command::new("verify")
                .about("Re-hash the stored files of a snapshot")
                .arg(Arg::new("snapshot").required(true)),
        )
        .subcommand(
            Command::new("snapshot-delete")
                .about("Delete a snapshot")
                .arg(Arg::new("snapshot").required(true)),
        )
        .subcommand(
            Command::new("helper")
                .about("Run an archive's flags against the local prefix")
                .arg(Arg::new("archive").required(true))
                .arg(
                    Arg::new("flag")
                        .allow_hyphen_values(true)
                        .help("--info, --manifest, --install or --uninstall"),
                )
                .arg(
                    Arg::new("strict")
                        .long("strict")
                        .action(ArgAction::SetTrue)
                        .help("Exit with status 2 on an unsupported flag"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("tabsync.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
