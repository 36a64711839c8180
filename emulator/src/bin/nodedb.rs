// nodedb credential database firmware and supporting software libraries
//
// Copyright (C) 2024 Alekos Filini
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::str::FromStr;

use env_logger::Env;

use clap::{Args, Parser, Subcommand};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nodemgmt::geometry::Chip;
use nodemgmt::profile::{format_profile, UserPreferences};
use nodemgmt::session::{ParentKind, Session};
use nodemgmt::{FlashDriver, RamFlash};

use emulator::utils::db;
use emulator::utils::flash::Flash;
use emulator::utils::model::get_entropy;
use emulator::utils::report::render_database;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[clap(flatten)]
    global_opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// File holding the flash image
    ///
    /// If unspecified an erased flash is kept in memory and every change is lost on exit.
    #[clap(long, short = 'f')]
    flash_file: Option<PathBuf>,

    /// Chip used when creating a new image
    #[clap(long, default_value = "16m")]
    chip: String,

    /// Write changes back to the flash file
    ///
    /// Without this flag commands work on a temporary copy of the image. Also required to
    /// create `--flash-file` when it doesn't exist.
    #[clap(long, action = clap::ArgAction::SetTrue, default_value_t = false)]
    allow_changes: bool,

    /// Entropy used to generate random entries
    ///
    /// If unspecified it will be generated randomly.
    #[clap(long, short = 'e')]
    entropy: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Erase the profile of a user and write default preferences
    FormatUser { uid: u8 },
    /// Remove every node of a user, then its profile
    DeleteUser { uid: u8 },
    /// Store a login, creating the service when needed
    AddCredential {
        uid: u8,
        service: String,
        login: String,
        #[clap(long, default_value = "0")]
        type_id: usize,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(long, default_value = "")]
        password: String,
        #[clap(long, default_value = "0")]
        category: u8,
    },
    /// Store the content of a file as a data entry
    StoreData {
        uid: u8,
        name: String,
        input: PathBuf,
        #[clap(long, default_value = "0")]
        type_id: usize,
    },
    /// Write the content of a data entry to a file
    ReadData {
        uid: u8,
        name: String,
        output: PathBuf,
        #[clap(long, default_value = "0")]
        type_id: usize,
    },
    /// Fill the database of a user with random credentials
    Populate {
        uid: u8,
        #[clap(long, default_value = "16")]
        count: usize,
    },
    /// List services and logins of a user
    List {
        uid: u8,
        #[clap(long, default_value = "0")]
        type_id: usize,
    },
    /// Print the whole database as JSON
    Dump { output: Option<PathBuf> },
    /// Render the whole database to an HTML page
    Report { output: PathBuf },
    /// Print slot usage
    Stats,
}

impl Command {
    fn modifies(&self) -> bool {
        matches!(
            self,
            Command::FormatUser { .. }
                | Command::DeleteUser { .. }
                | Command::AddCredential { .. }
                | Command::StoreData { .. }
                | Command::Populate { .. }
        )
    }
}

async fn open_flash(opts: &GlobalOpts) -> Result<(Flash, RamFlash), emulator::Error> {
    let chip = Chip::from_str(&opts.chip).map_err(|e| format!("Invalid chip: {:?}", e))?;
    let geometry = chip.geometry();

    match &opts.flash_file {
        Some(path) if path.exists() => {
            let flash = Flash::load_from_file(path, opts.allow_changes).await?;
            let ram = flash.load(None).await?;
            Ok((flash, ram))
        }
        Some(path) if opts.allow_changes => {
            let flash = Flash::create(path, geometry).await?;
            Ok((flash, RamFlash::new(geometry)))
        }
        Some(path) => Err(format!(
            "{} doesn't exist, use --allow-changes to create it",
            path.display()
        )
        .into()),
        None => {
            log::warn!("No flash file given, changes will be lost");
            let flash = Flash::empty_temp_flash(geometry).await?;
            Ok((flash, RamFlash::new(geometry)))
        }
    }
}

fn random_word<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

fn populate(ram: &mut RamFlash, uid: u8, count: usize, entropy: u64) -> Result<(), emulator::Error> {
    let mut rng = StdRng::seed_from_u64(entropy);
    let mut session = Session::open(ram, uid)?;

    for _ in 0..count {
        let service = format!("{}.com", random_word(&mut rng, 8));
        let login = random_word(&mut rng, 6);
        let password = random_word(&mut rng, 12);
        let type_id = rng.gen_range(0..nodemgmt::NB_CRED_ROOTS);
        session.set_current_category(rng.gen_range(0..nodemgmt::NB_CATEGORIES as u8))?;

        match db::add_credential(&mut session, type_id, &service, &login, "", password.as_bytes()) {
            Err(emulator::Error::Database(nodemgmt::Error::NoSpace)) => {
                log::warn!("Database full");
                break;
            }
            other => other?,
        };
    }

    Ok(())
}

fn list(ram: &mut RamFlash, uid: u8, type_id: usize) -> Result<(), emulator::Error> {
    let mut session = Session::open(ram, uid)?;
    for parent in session.parents(ParentKind::Credential, type_id)? {
        let node = session.read_parent_node(parent)?;
        println!("{} {}", parent, db::decode_str(&node.service));

        for child in session.children(parent)? {
            let node = session.read_cred_child_node_except_pwd(child)?;
            println!(
                "  {} {} (category {})",
                child,
                db::decode_str(&node.login),
                node.flags().category
            );
        }
    }

    for parent in session.parents(ParentKind::Data, type_id.min(nodemgmt::NB_DATA_ROOTS - 1))? {
        let node = session.read_parent_node(parent)?;
        let len = db::read_data(&mut session, parent)?.len();
        println!("{} {} ({} bytes)", parent, db::decode_str(&node.service), len);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), emulator::Error> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    let entropy = get_entropy(&args.global_opts.entropy);
    let (flash, mut ram) = open_flash(&args.global_opts).await?;

    match &args.command {
        Command::FormatUser { uid } => {
            format_profile(&mut ram, *uid, &UserPreferences::default())?;
            log::info!("Formatted user {}", uid);
        }
        Command::DeleteUser { uid } => {
            Session::open(&mut ram, *uid)?.delete_current_user()?;
        }
        Command::AddCredential {
            uid,
            service,
            login,
            type_id,
            description,
            password,
            category,
        } => {
            let mut session = Session::open(&mut ram, *uid)?;
            session.set_current_category(*category)?;
            let addr = db::add_credential(
                &mut session,
                *type_id,
                service,
                login,
                description,
                password.as_bytes(),
            )?;
            log::info!("Stored {}@{} at {}", login, service, addr);
        }
        Command::StoreData {
            uid,
            name,
            input,
            type_id,
        } => {
            let payload = tokio::fs::read(input).await?;
            let mut session = Session::open(&mut ram, *uid)?;
            db::store_data(&mut session, *type_id, name, &payload)?;
        }
        Command::ReadData {
            uid,
            name,
            output,
            type_id,
        } => {
            let mut session = Session::open(&mut ram, *uid)?;
            let parent = db::find_parent(&mut session, ParentKind::Data, *type_id, name)?
                .ok_or_else(|| format!("{} not found", name))?;
            let payload = db::read_data(&mut session, parent)?;
            tokio::fs::write(output, &payload).await?;
        }
        Command::Populate { uid, count } => {
            log::info!("Populating user {} with entropy {}", uid, entropy);
            populate(&mut ram, *uid, *count, entropy)?;
        }
        Command::List { uid, type_id } => list(&mut ram, *uid, *type_id)?,
        Command::Dump { output } => {
            let json = serde_json::to_string_pretty(&db::dump_database(&mut ram)?)?;
            match output {
                Some(path) => tokio::fs::write(path, json).await?,
                None => println!("{}", json),
            }
        }
        Command::Report { output } => {
            let html = render_database(&db::dump_database(&mut ram)?)?;
            tokio::fs::write(output, html).await?;
            log::info!("Rendered report to: {}", output.display());
        }
        Command::Stats => {
            let [cred_parents, cred_children, data_parents, data_children] =
                db::node_stats(&mut ram)?;
            println!("Chip: {}", ram.geometry().chip);
            println!("Free slots: {}", nodemgmt::free::count_free_slots(&mut ram)?);
            println!("Credential parents: {}", cred_parents);
            println!("Credential children: {}", cred_children);
            println!("Data parents: {}", data_parents);
            println!("Data children: {}", data_children);
        }
    }

    if args.command.modifies() {
        flash.store(&ram).await?;
        if flash.is_temporary() {
            log::warn!("Changes stored to a temporary copy, use --allow-changes to keep them");
        }
    }

    Ok(())
}
