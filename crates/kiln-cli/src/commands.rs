use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _};
use colored::Colorize;
use kiln_core::{Config, Context, Dispatcher, ModuleKind, Oid, Options, Value};
use kiln_server::{KilnServer, ServerConfig};

use crate::cli::*;

pub fn run_command(cli: Cli, config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let out = Output { format: cli.format };
    if let Command::Config(args) = cli.command {
        return cmd_config(&out, args, &config, &config_path);
    }

    let d = open(config)?;
    match cli.command {
        Command::Import(args) => cmd_import(&out, &d, args),
        Command::Run(args) => cmd_run(&out, &d, args),
        Command::Show(args) => cmd_show(&out, &d, args),
        Command::Collection(args) => cmd_collection(&out, &d, args),
        Command::Tag(args) => cmd_tag(&out, &d, args),
        Command::Drop(args) => cmd_drop(&out, &d, args),
        Command::Modules(args) => cmd_modules(&out, &d, args),
        Command::Serve(args) => cmd_serve(d, args),
        Command::Config(_) => Ok(()),
    }
}

fn open(config: Config) -> anyhow::Result<Dispatcher> {
    let ctx = Context::open(config, kiln_modules::catalog()).context("cannot open the kiln store")?;
    ctx.install_cleanup_handler()
        .context("cannot install the signal handler")?;
    Ok(Dispatcher::new(ctx)?)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct Output {
    format: OutputFormat,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Print `json` in JSON mode, otherwise run `text`.
    fn emit(&self, json: serde_json::Value, text: impl FnOnce()) {
        if self.json() {
            println!("{json}");
        } else {
            text();
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Bytes(b) if b.len() > 64 => format!("<{} bytes>", b.len()),
        other => serde_json::to_string_pretty(&other.to_json()).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Parse repeated `name=value` options. Values stay strings; the module's
/// schema coerces them.
fn parse_opts(raw: &[String]) -> anyhow::Result<Options> {
    let mut opts = Options::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("option '{item}' is not of the form name=value"))?;
        opts.insert(name.trim().to_string(), Value::from(value.trim()));
    }
    Ok(opts)
}

/// An OID hex string, or the name of a collection.
fn resolve_target(d: &Dispatcher, target: &str) -> anyhow::Result<Oid> {
    if Oid::is_oid_like(target) {
        return Ok(Oid::from_hex(target)?);
    }
    d.collection_by_name(target)?
        .ok_or_else(|| anyhow!("'{target}' is neither an OID nor a collection name"))
}

fn resolve_targets(d: &Dispatcher, targets: &[String]) -> anyhow::Result<Vec<Oid>> {
    targets.iter().map(|t| resolve_target(d, t)).collect()
}

fn parse_oid(s: &str) -> anyhow::Result<Oid> {
    Oid::from_hex(s).with_context(|| format!("'{s}' is not an OID"))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_import(out: &Output, d: &Dispatcher, args: ImportArgs) -> anyhow::Result<()> {
    let mut imported = Vec::new();
    let mut skipped = 0usize;
    for path in &args.paths {
        let report = d.import_path(path)?;
        for (file, error) in &report.skipped {
            if !out.json() {
                eprintln!("{} {}: {error}", "skipped".yellow(), file.display());
            }
        }
        skipped += report.skipped.len();
        imported.extend(report.imported);
    }

    let oids: Vec<Oid> = {
        let mut seen = std::collections::BTreeSet::new();
        imported.iter().map(|(_, o)| *o).filter(|o| seen.insert(*o)).collect()
    };
    let cid = match &args.collection {
        Some(name) if !oids.is_empty() => Some(d.create_collection(name, &oids, &args.notes)?),
        _ => None,
    };

    out.emit(
        serde_json::json!({
            "imported": imported
                .iter()
                .map(|(p, o)| serde_json::json!({ "path": p.display().to_string(), "oid": o.to_hex() }))
                .collect::<Vec<_>>(),
            "skipped": skipped,
            "collection": cid.map(|c| c.to_hex()),
        }),
        || {
            for (path, oid) in &imported {
                println!("{}  {}", oid.to_hex().yellow(), path.display());
            }
            println!(
                "{} Imported {} files ({} distinct), skipped {}",
                "✓".green().bold(),
                imported.len(),
                oids.len(),
                skipped
            );
            if let (Some(cid), Some(name)) = (cid, &args.collection) {
                println!("  Collection {} = {}", name.bold(), cid.to_hex().cyan());
            }
        },
    );
    Ok(())
}

fn cmd_run(out: &Output, d: &Dispatcher, args: RunArgs) -> anyhow::Result<()> {
    let oids = resolve_targets(d, &args.targets)?;
    let opts = parse_opts(&args.opts)?;
    let report = d.process_report(&args.module, &oids, &opts, args.force)?;

    out.emit(
        serde_json::json!({
            "module": report.module,
            "success": report.is_success(),
            "cached": report.cached,
            "computed": report.computed,
            "failures": report
                .failures
                .iter()
                .map(|f| serde_json::json!({ "oid": f.oid.to_hex(), "error": f.error.to_string() }))
                .collect::<Vec<_>>(),
        }),
        || {
            for failure in &report.failures {
                println!(
                    "{} {} {}: {}",
                    "✗".red().bold(),
                    report.module.bold(),
                    failure.oid.to_hex().yellow(),
                    failure.error
                );
            }
            let mark = if report.is_success() { "✓".green().bold() } else { "!".red().bold() };
            println!(
                "{mark} {}: {} computed, {} cached, {} failed",
                report.module.bold(),
                report.computed,
                report.cached,
                report.failures.len()
            );
        },
    );
    if !report.is_success() {
        bail!("{} of {} OIDs failed", report.failures.len(), report.oids.len());
    }
    Ok(())
}

fn cmd_show(out: &Output, d: &Dispatcher, args: ShowArgs) -> anyhow::Result<()> {
    let oids = resolve_targets(d, &args.targets)?;
    let opts = parse_opts(&args.opts)?;
    let value = match &args.field {
        Some(field) => {
            let [oid] = oids.as_slice() else {
                bail!("--field needs exactly one target");
            };
            d.get_field(&args.module, oid, field, &opts)?
        }
        None => d.retrieve(&args.module, &oids, &opts, args.lock)?,
    };

    match value {
        Some(value) => out.emit(value.to_json(), || println!("{}", render(&value))),
        None => out.emit(serde_json::Value::Null, || println!("{}", "(no result)".dimmed())),
    }
    Ok(())
}

fn cmd_collection(out: &Output, d: &Dispatcher, args: CollectionArgs) -> anyhow::Result<()> {
    match args.action.unwrap_or(CollectionAction::List) {
        CollectionAction::List => {
            let all = d.list_collections()?;
            out.emit(serde_json::to_value(&all)?, || {
                if all.is_empty() {
                    println!("No collections.");
                }
                for c in &all {
                    println!(
                        "{}  {} ({} members){}",
                        c.cid.to_hex().yellow(),
                        c.name.bold(),
                        c.num_members,
                        if c.notes.is_empty() { String::new() } else { format!("  {}", c.notes.dimmed()) }
                    );
                }
            });
        }
        CollectionAction::Create { name, oids, notes } => {
            let oids = oids.iter().map(|s| parse_oid(s)).collect::<anyhow::Result<Vec<_>>>()?;
            let cid = d.create_collection(&name, &oids, &notes)?;
            out.emit(serde_json::json!({ "cid": cid.to_hex(), "name": name }), || {
                println!("{} Created collection {} = {}", "✓".green().bold(), name.bold(), cid.to_hex().cyan());
            });
        }
        CollectionAction::Delete { name } => {
            let cid = d.delete_collection(&name)?;
            out.emit(serde_json::json!({ "deleted": cid.to_hex() }), || {
                println!("Deleted collection {}", name.bold());
            });
        }
        CollectionAction::Rename { old, new } => {
            let cid = d.rename_collection(&old, &new)?;
            out.emit(serde_json::json!({ "cid": cid.to_hex(), "name": new }), || {
                println!("Renamed {} → {}", old.bold(), new.bold());
            });
        }
        CollectionAction::Prune { name, oids } => {
            let oids = oids.iter().map(|s| parse_oid(s)).collect::<anyhow::Result<Vec<_>>>()?;
            let cid = d.prune_collection(&name, &oids)?;
            out.emit(serde_json::json!({ "cid": cid.map(|c| c.to_hex()) }), || match cid {
                Some(cid) => println!("Collection {} is now {}", name.bold(), cid.to_hex().cyan()),
                None => println!("Collection {} was emptied and deleted", name.bold()),
            });
        }
        CollectionAction::Members { name } => {
            let cid = d
                .collection_by_name(&name)?
                .ok_or_else(|| anyhow!("no collection named '{name}'"))?;
            let members = d.collection_members(&cid)?.unwrap_or_default();
            out.emit(
                serde_json::json!(members.iter().map(Oid::to_hex).collect::<Vec<_>>()),
                || {
                    for oid in &members {
                        println!("{}", oid.to_hex());
                    }
                },
            );
        }
    }
    Ok(())
}

fn cmd_tag(out: &Output, d: &Dispatcher, args: TagArgs) -> anyhow::Result<()> {
    match args.action {
        TagAction::Set { oid, tag, value } => {
            let oid = parse_oid(&oid)?;
            let value = serde_json::from_str::<serde_json::Value>(&value)
                .map(|j| Value::from_json(&j))
                .unwrap_or(Value::Str(value));
            d.tag_set(&oid, &tag, value)?;
            out.emit(serde_json::json!({ "ok": true }), || {
                println!("Tagged {} with {}", oid.short_hex().yellow(), tag.bold());
            });
        }
        TagAction::Get { oid } => {
            let oid = parse_oid(&oid)?;
            let tags = d.tag_get(&oid)?;
            let value = Value::Map(tags);
            out.emit(value.to_json(), || {
                match value.as_map() {
                    Some(tags) if !tags.is_empty() => {
                        for (tag, v) in tags {
                            println!("{} = {}", tag.bold(), render(v));
                        }
                    }
                    _ => println!("No tags."),
                }
            });
        }
        TagAction::Remove { oid, tag } => {
            let oid = parse_oid(&oid)?;
            let removed = d.tag_remove(&oid, &tag)?;
            out.emit(serde_json::json!({ "removed": removed }), || {
                if removed {
                    println!("Removed tag {}", tag.bold());
                } else {
                    println!("No tag {} on {}", tag.bold(), oid.short_hex());
                }
            });
        }
        TagAction::Find { tag } => {
            let oids = d.tagged(&tag)?;
            out.emit(
                serde_json::json!(oids.iter().map(Oid::to_hex).collect::<Vec<_>>()),
                || {
                    for oid in &oids {
                        println!("{}", oid.to_hex());
                    }
                },
            );
        }
    }
    Ok(())
}

fn cmd_drop(out: &Output, d: &Dispatcher, args: DropArgs) -> anyhow::Result<()> {
    match args.action {
        DropAction::Oid { oid } => {
            let oid = parse_oid(&oid)?;
            let report = d.flush_oid(&oid)?;
            out.emit(
                serde_json::json!({
                    "artifacts": report.artifacts,
                    "recreated": report.recreated.len(),
                    "deleted_collections": report.deleted_collections.len(),
                }),
                || {
                    println!(
                        "{} Dropped {}: {} artifacts, {} collections rebuilt, {} deleted",
                        "✓".green().bold(),
                        oid.to_hex().yellow(),
                        report.artifacts,
                        report.recreated.len(),
                        report.deleted_collections.len()
                    );
                },
            );
        }
        DropAction::Module { module } => {
            let removed = d.flush_module(&module)?;
            out.emit(serde_json::json!({ "removed": removed }), || {
                println!("{} Dropped {} artifacts of {}", "✓".green().bold(), removed, module.bold());
            });
        }
        DropAction::Artifact { module, oid, opts } => {
            let oid = parse_oid(&oid)?;
            let removed = d.flush_artifact(&module, &oid, &parse_opts(&opts)?)?;
            out.emit(serde_json::json!({ "removed": removed }), || {
                if removed {
                    println!("{} Dropped {} for {}", "✓".green().bold(), module.bold(), oid.short_hex());
                } else {
                    println!("Nothing stored for {} on {}", module.bold(), oid.short_hex());
                }
            });
        }
    }
    Ok(())
}

fn cmd_modules(out: &Output, d: &Dispatcher, args: ModulesArgs) -> anyhow::Result<()> {
    let registry = d.context().registry();
    if let Some(name) = &args.name {
        let doc = registry
            .documentation(name)
            .ok_or_else(|| anyhow!("unknown module '{name}'"))?;
        out.emit(serde_json::json!({ "name": name, "documentation": doc }), || print!("{doc}"));
        return Ok(());
    }

    let infos = match &args.kind {
        Some(kind) => {
            let kind: ModuleKind = kind.parse().map_err(|e| anyhow!("{e}"))?;
            registry.modules_of_kind(kind)
        }
        None => registry.modules(),
    };
    out.emit(
        serde_json::json!(infos
            .iter()
            .map(|i| serde_json::json!({ "name": i.name, "kind": i.kind.to_string() }))
            .collect::<Vec<_>>()),
        || {
            for info in &infos {
                println!(
                    "{:<20} {:<12} {}",
                    info.name.bold(),
                    info.kind.to_string().cyan(),
                    info.description.dimmed()
                );
            }
        },
    );
    Ok(())
}

fn cmd_config(out: &Output, args: ConfigArgs, config: &Config, path: &Path) -> anyhow::Result<()> {
    match (&args.key, &args.value) {
        (Some(key), Some(value)) => {
            let updated = config.with_setting(key, value)?;
            updated.save(path)?;
            out.emit(serde_json::json!({ key.as_str(): updated.get(key)? }), || {
                println!("Set {} = {} in {}", key.bold(), value, path.display());
            });
        }
        (Some(key), None) => {
            let value = config.get(key)?;
            out.emit(serde_json::json!({ key.as_str(): value }), || println!("{} = {value}", key.bold()));
        }
        _ => {
            let text = toml_text(config)?;
            out.emit(serde_json::to_value(config)?, || {
                println!("{}", format!("# {}", path.display()).dimmed());
                print!("{text}");
            });
        }
    }
    Ok(())
}

fn toml_text(config: &Config) -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

fn cmd_serve(d: Dispatcher, args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig {
        bind_addr: args
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", args.bind))?,
        allow_flush: !args.no_flush,
        ..ServerConfig::default()
    };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(KilnServer::new(config, d).serve())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::open(Config::with_root(dir.path()), kiln_modules::catalog()).unwrap();
        (dir, Dispatcher::new(ctx).unwrap())
    }

    #[test]
    fn options_parse_as_strings() {
        let opts = parse_opts(&["block_size=512".into(), " trace = yes ".into()]).unwrap();
        assert_eq!(opts.get("block_size"), Some(&Value::from("512")));
        assert_eq!(opts.get("trace"), Some(&Value::from("yes")));
        assert!(parse_opts(&["oops".into()]).is_err());
    }

    #[test]
    fn targets_resolve_oids_and_collection_names() {
        let (_dir, d) = dispatcher();
        let oid = d.import_bytes("x", b"x").unwrap();
        let cid = d.create_collection("xs", &[oid], "").unwrap();
        assert_eq!(resolve_target(&d, &oid.to_hex()).unwrap(), oid);
        assert_eq!(resolve_target(&d, "xs").unwrap(), cid);
        assert!(resolve_target(&d, "missing").is_err());
    }

    #[test]
    fn config_listing_covers_every_section() {
        let text = toml_text(&Config::default()).unwrap();
        assert!(text.contains("[multiprocessing]"));
        assert!(text.contains("max_file_size = 67108864"));
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, Config::default());
    }
}
