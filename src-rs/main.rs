use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use rand::Rng;
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vision_ask::codec::DEFAULT_SYSTEM_INSTRUCTION;
use vision_ask::executor::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use vision_ask::{
    encode_png, parse_annotations, prepare, prepare_image, AnnotationEvent, ChatRequest,
    ClientConfig, CropRegion, Pipeline, PreparedImage, QueryBuilder, VisionClient,
};

const ANNOTATIONS_HELP: &str = r##"Annotation JSON (any of the following):

1) Drawing-canvas export (fabric.js style):
{
  "objects": [
    {"type": "rect", "left": 120, "top": 40, "width": 200, "height": 90, "scaleX": 1, "scaleY": 1}
  ]
}

2) Annotation document:
{"annotations": [{"type": "rect", "x": 120, "y": 40, "w": 200, "h": 90}]}

3) Bare list:
[{"x": 120, "y": 40, "w": 200, "h": 90}]

Notes:
- coordinates are pixels of the normalized image (after --max-width scaling).
- only the LAST rectangle is used; earlier shapes are drawing history.
- shapes whose type is not rect/rectangle are skipped; a missing type means rect.
- shapes with no rectangle among them are an error (omit --annotations to use the whole image).
- effective size is width*scaleX by height*scaleY.
- the rectangle is clamped to the image; if nothing is left the command fails.
"##;

#[derive(Parser, Debug)]
#[command(
    name = "vision-ask",
    version,
    about = "Crop an image to a drawn region and ask a vision-language model about it"
)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (error|warn|info|debug|trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Print the accepted annotation JSON formats
    #[command(name = "annotations-help")]
    AnnotationsHelp,
    /// Normalize an image, crop it to the last drawn rectangle and save it as PNG
    Crop(CropArgs),
    /// Build the model request JSON without sending it
    Prompt(PromptArgs),
    /// Ask the vision model a question about an image (or a drawn region of it)
    Ask(AskArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Input image path (PNG/JPEG/GIF), or - for stdin
    input: String,
    /// Annotation JSON path, or - for stdin (see `annotations-help`)
    #[arg(long)]
    annotations: Option<String>,
    /// Scale the image down to at most this many pixels wide
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_width: Option<u32>,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Question to ask about the image
    #[arg(long, short)]
    question: String,
    /// System instruction (default: step-by-step math tutor answering in Vietnamese)
    #[arg(long, conflicts_with = "system_file")]
    system: Option<String>,
    /// Read the system instruction from a file
    #[arg(long)]
    system_file: Option<PathBuf>,
    /// Model identifier (default: VISION_ASK_MODEL or gpt-4-turbo)
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args, Debug)]
struct CropArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Output PNG path
    output: PathBuf,
    /// Path to write crop metadata sidecar (default: <output>.json)
    #[arg(long)]
    meta_out: Option<PathBuf>,
    /// Disable metadata sidecar output
    #[arg(long, action = ArgAction::SetTrue)]
    no_meta: bool,
}

#[derive(Args, Debug)]
struct PromptArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    query: QueryArgs,
    /// Write the request JSON here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AskArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    query: QueryArgs,
    /// API key (default: OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
    /// API base URL (default: OPENAI_BASE_URL / OPENAI_API_BASE or https://api.openai.com/v1)
    #[arg(long)]
    base_url: Option<String>,
    /// Give up on the model after this many seconds (default: wait indefinitely)
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Save the image sent, the request, and the answer under the artifact directory
    #[arg(long, action = ArgAction::SetTrue)]
    save: bool,
    /// Artifact root (default: VISION_ASK_OUT_DIR / .vision-ask)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Print a JSON envelope instead of the bare answer
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::AnnotationsHelp => {
            println!("{}", ANNOTATIONS_HELP.trim());
            Ok(())
        }
        Commands::Crop(args) => command_crop(args),
        Commands::Prompt(args) => command_prompt(args),
        Commands::Ask(args) => command_ask(args),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "crop",
            "description": "Normalize an image and crop it to the last drawn rectangle.",
        }),
        json!({
            "name": "prompt",
            "description": "Build the multimodal request JSON without contacting the model.",
        }),
        json!({
            "name": "ask",
            "description": "Ask a vision-language model a question about an image or region.",
        }),
        json!({
            "name": "annotations-help",
            "description": "Describe the accepted annotation JSON formats.",
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_crop(args: CropArgs) -> Result<()> {
    let (raw, annotations) = load_source(&args.source)?;
    let prepared = prepare_image(&raw, &annotations, args.source.max_width)?;

    write_png(&args.output, &prepared)?;

    if !args.no_meta {
        let meta_path = args
            .meta_out
            .clone()
            .unwrap_or_else(|| default_sidecar_for(&args.output));
        let payload = json!({
            "crop_meta_version": 1,
            "input_path": input_display(&args.source.input),
            "output_path": abs_path(&args.output).display().to_string(),
            "meta_path": abs_path(&meta_path).display().to_string(),
            "generated_at": timestamp_iso(),
            "max_width": args.source.max_width,
            "normalized_size": size_value(prepared.normalized_size),
            "size": size_value(prepared.image.dimensions()),
            "annotation_count": annotations.len(),
            "region": region_value(prepared.region),
        });
        write_json_pretty(&meta_path, &payload)?;
    }

    println!("{}", abs_path(&args.output).display());
    Ok(())
}

fn command_prompt(args: PromptArgs) -> Result<()> {
    let question = validated_question(&args.query.question)?;
    let (raw, annotations) = load_source(&args.source)?;
    let builder = query_builder(&args.query)?;
    let model = resolve_model(args.query.model.as_deref());

    let prepared = prepare(
        &raw,
        &annotations,
        question,
        args.source.max_width,
        &builder,
    )?;
    let request = ChatRequest::new(&model, &prepared.query);
    let rendered = serde_json::to_string_pretty(&request)?;

    match args.out {
        Some(out) => {
            write_text_file(&out, &rendered)?;
            println!("{}", abs_path(&out).display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn command_ask(args: AskArgs) -> Result<()> {
    let question = validated_question(&args.query.question)?;
    let (raw, annotations) = load_source(&args.source)?;
    let builder = query_builder(&args.query)?;

    let config = ClientConfig {
        base_url: resolve_setting(args.base_url.as_deref(), &["OPENAI_BASE_URL", "OPENAI_API_BASE"])
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        api_key: resolve_setting(args.api_key.as_deref(), &["OPENAI_API_KEY"])
            .ok_or_else(|| anyhow!("missing API key: pass --api-key or set OPENAI_API_KEY"))?,
        model: resolve_model(args.query.model.as_deref()),
        timeout: args.timeout_secs.map(Duration::from_secs),
    };
    debug!(base_url = %config.base_url, model = %config.model, "resolved client config");

    let pipeline = Pipeline::new(
        args.source.max_width,
        builder,
        VisionClient::new(&config)?,
    );
    let prepared = pipeline.prepare(&raw, &annotations, question)?;

    let run_files = if args.save {
        let root = args.out_dir.clone().unwrap_or_else(out_root);
        let files = RunFiles::new(&root.join("ask"));
        write_png(&files.image, &prepared.image)?;
        let request = pipeline.client().request_for(&prepared.query);
        write_json_pretty(&files.request, &serde_json::to_value(&request)?)?;
        info!(image = %files.image.display(), "saved query artifacts");
        Some(files)
    } else {
        None
    };

    let mut record = json!({
        "run_version": 1,
        "generated_at": timestamp_iso(),
        "input_path": input_display(&args.source.input),
        "question": question,
        "model": config.model,
        "normalized_size": size_value(prepared.image.normalized_size),
        "size": size_value(prepared.image.image.dimensions()),
        "region": region_value(prepared.image.region),
    });

    let output = match pipeline.execute(prepared) {
        Ok(output) => output,
        Err(err) => {
            // A failed call still leaves a record next to the saved image and request.
            if let Some(files) = &run_files {
                record["error"] = json!(err.to_string());
                record["image_path"] = json!(abs_path(&files.image).display().to_string());
                record["request_path"] = json!(abs_path(&files.request).display().to_string());
                write_json_pretty(&files.record, &record)?;
            }
            return Err(err.into());
        }
    };

    let mut artifacts = Value::Null;
    if let Some(files) = &run_files {
        write_text_file(&files.answer, &output.answer.text)?;
        record["usage"] = json!(output.answer.usage);
        record["image_path"] = json!(abs_path(&files.image).display().to_string());
        record["request_path"] = json!(abs_path(&files.request).display().to_string());
        record["answer_path"] = json!(abs_path(&files.answer).display().to_string());
        write_json_pretty(&files.record, &record)?;
        artifacts = json!({
            "image_path": abs_path(&files.image).display().to_string(),
            "request_path": abs_path(&files.request).display().to_string(),
            "answer_path": abs_path(&files.answer).display().to_string(),
            "record_path": abs_path(&files.record).display().to_string(),
        });
    }

    if args.json {
        let payload = json!({
            "answer": output.answer.text,
            "model": config.model,
            "usage": output.answer.usage,
            "normalized_size": size_value(output.image.normalized_size),
            "region": region_value(output.image.region),
            "artifacts": artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", output.answer.text);
    }

    Ok(())
}

/// Artifact paths for one `ask --save` run.
#[derive(Debug)]
struct RunFiles {
    image: PathBuf,
    request: PathBuf,
    answer: PathBuf,
    record: PathBuf,
}

impl RunFiles {
    fn new(dir: &Path) -> Self {
        let run_id = format!(
            "{}-{}-{}",
            timestamp_compact(),
            std::process::id(),
            rand::thread_rng().gen_range(1000..9999)
        );
        let base = format!("ask-{run_id}");
        Self {
            image: dir.join(format!("{base}-image.png")),
            request: dir.join(format!("{base}-request.json")),
            answer: dir.join(format!("{base}-answer.md")),
            record: dir.join(format!("{base}.json")),
        }
    }
}

fn load_source(source: &SourceArgs) -> Result<(Vec<u8>, Vec<AnnotationEvent>)> {
    if source.input == "-" && source.annotations.as_deref() == Some("-") {
        bail!("image and annotations cannot both be read from stdin");
    }
    let raw = read_input_bytes(&source.input)?;
    let annotations = match source.annotations.as_deref() {
        Some(path) => load_annotations(path)?,
        None => Vec::new(),
    };
    debug!(
        input_bytes = raw.len(),
        annotations = annotations.len(),
        "loaded source"
    );
    Ok((raw, annotations))
}

fn read_input_bytes(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read image from stdin")?;
        return Ok(buf);
    }
    fs::read(path).with_context(|| format!("failed to read input image: {path}"))
}

fn load_annotations(path: &str) -> Result<Vec<AnnotationEvent>> {
    let raw = if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read annotations from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read annotations file: {path}"))?
    };

    parse_annotations(&raw).context(
        "invalid annotation JSON: expected a list, {\"objects\": [...]} or {\"annotations\": [...]}",
    )
}

fn validated_question(question: &str) -> Result<&str> {
    if question.trim().is_empty() {
        bail!("question must not be empty");
    }
    Ok(question)
}

fn query_builder(args: &QueryArgs) -> Result<QueryBuilder> {
    if let Some(text) = &args.system {
        return Ok(QueryBuilder::new(text.as_str()));
    }
    if let Some(path) = &args.system_file {
        let text = fs::read_to_string(path).with_context(|| {
            format!("failed to read system instruction: {}", path.display())
        })?;
        return Ok(QueryBuilder::new(text.trim_end()));
    }
    Ok(QueryBuilder::new(DEFAULT_SYSTEM_INSTRUCTION))
}

fn resolve_model(flag: Option<&str>) -> String {
    resolve_setting(flag, &["VISION_ASK_MODEL"]).unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Flag value, else the first non-empty environment variable among `env_keys`.
fn resolve_setting(flag: Option<&str>, env_keys: &[&str]) -> Option<String> {
    flag.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            env_keys.iter().find_map(|key| {
                env::var(key)
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
        })
}

fn size_value((width, height): (u32, u32)) -> Value {
    json!({"width": width, "height": height, "units": "px"})
}

fn region_value(region: Option<CropRegion>) -> Value {
    match region {
        Some(r) => json!({
            "left": r.left(),
            "top": r.top(),
            "right": r.right(),
            "bottom": r.bottom(),
            "width": r.width(),
            "height": r.height(),
        }),
        None => Value::Null,
    }
}

fn input_display(input: &str) -> String {
    if input == "-" {
        return "<stdin>".to_string();
    }
    abs_path(Path::new(input)).display().to_string()
}

fn write_png(path: &Path, prepared: &PreparedImage) -> Result<()> {
    ensure_parent_dir(path)?;
    let bytes = encode_png(&prepared.image)?;
    fs::write(path, bytes).with_context(|| format!("failed to save image: {}", path.display()))
}

fn write_text_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("failed to write text: {}", path.display()))
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn default_sidecar_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}.json"))
}

fn out_root() -> PathBuf {
    env::var("VISION_ASK_OUT_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".vision-ask"))
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::tempdir;
    use vision_ask::codec::{ChatMessage, ContentPart};

    fn write_fixture_png(path: &Path, w: u32, h: u32) {
        let img = RgbaImage::from_fn(w, h, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255]));
        DynamicImage::ImageRgba8(img).save(path).unwrap();
    }

    fn source(input: &Path, annotations: Option<&Path>, max_width: Option<u32>) -> SourceArgs {
        SourceArgs {
            input: input.display().to_string(),
            annotations: annotations.map(|p| p.display().to_string()),
            max_width,
        }
    }

    fn query_args(question: &str) -> QueryArgs {
        QueryArgs {
            question: question.to_string(),
            system: None,
            system_file: None,
            model: Some("gpt-test".to_string()),
        }
    }

    #[test]
    fn writes_json_pretty() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b.json");
        write_json_pretty(&target, &json!({"ok": true})).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn sidecar_sits_next_to_output() {
        assert_eq!(
            default_sidecar_for(Path::new("out/crop.png")),
            PathBuf::from("out/crop.json")
        );
        assert_eq!(
            default_sidecar_for(Path::new("crop.png")),
            PathBuf::from("crop.json")
        );
    }

    #[test]
    fn blank_questions_are_rejected() {
        assert!(validated_question("   \n").is_err());
        assert_eq!(validated_question(" What is 2+2? ").unwrap(), " What is 2+2? ");
    }

    #[test]
    fn flag_beats_environment_and_blank_flag_falls_through() {
        assert_eq!(
            resolve_setting(Some(" gpt-4o "), &["VISION_ASK_TEST_UNSET_VAR"]),
            Some("gpt-4o".to_string())
        );
        assert_eq!(
            resolve_setting(Some("  "), &["VISION_ASK_TEST_UNSET_VAR"]),
            None
        );
        assert_eq!(resolve_setting(None, &[]), None);
    }

    #[test]
    fn system_instruction_sources() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.txt");
        fs::write(&path, "Answer in English.\n").unwrap();

        let mut args = query_args("q");
        assert_eq!(
            query_builder(&args).unwrap().system_instruction(),
            DEFAULT_SYSTEM_INSTRUCTION
        );

        args.system_file = Some(path);
        assert_eq!(
            query_builder(&args).unwrap().system_instruction(),
            "Answer in English."
        );

        args.system = Some("Be terse.".to_string());
        assert_eq!(query_builder(&args).unwrap().system_instruction(), "Be terse.");
    }

    #[test]
    fn annotations_file_must_parse() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.json");
        fs::write(&good, r#"{"objects": [{"type": "rect", "left": 1, "top": 2, "width": 3, "height": 4}]}"#)
            .unwrap();
        let events = load_annotations(good.to_str().unwrap()).unwrap();
        assert_eq!(events, vec![AnnotationEvent::rect(1.0, 2.0, 3.0, 4.0)]);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{"shapes": 3}"#).unwrap();
        assert!(load_annotations(bad.to_str().unwrap()).is_err());
        assert!(load_annotations(dir.path().join("missing.json").to_str().unwrap()).is_err());
    }

    #[test]
    fn stdin_cannot_feed_both_inputs() {
        let args = SourceArgs {
            input: "-".to_string(),
            annotations: Some("-".to_string()),
            max_width: None,
        };
        assert!(load_source(&args).is_err());
    }

    #[test]
    fn crop_writes_png_and_sidecar() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("upload.png");
        write_fixture_png(&input, 400, 200);
        let annotations = dir.path().join("shapes.json");
        fs::write(
            &annotations,
            r#"[{"x": 0, "y": 0, "w": 10, "h": 10}, {"x": -5, "y": 90, "w": 20, "h": 30}]"#,
        )
        .unwrap();
        let output = dir.path().join("out").join("crop.png");

        command_crop(CropArgs {
            source: source(&input, Some(&annotations), Some(200)),
            output: output.clone(),
            meta_out: None,
            no_meta: false,
        })
        .unwrap();

        let cropped = image::open(&output).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (15, 10));

        let meta: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("out").join("crop.json")).unwrap())
                .unwrap();
        assert_eq!(meta["normalized_size"]["width"], 200);
        assert_eq!(meta["normalized_size"]["height"], 100);
        assert_eq!(meta["annotation_count"], 2);
        assert_eq!(meta["region"]["left"], 0);
        assert_eq!(meta["region"]["top"], 90);
        assert_eq!(meta["region"]["right"], 15);
        assert_eq!(meta["region"]["bottom"], 100);
    }

    #[test]
    fn crop_with_degenerate_rectangle_fails_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("upload.png");
        write_fixture_png(&input, 50, 50);
        let annotations = dir.path().join("shapes.json");
        fs::write(&annotations, r#"[{"x": 10, "y": 10, "w": 0, "h": 10}]"#).unwrap();
        let output = dir.path().join("crop.png");

        let err = command_crop(CropArgs {
            source: source(&input, Some(&annotations), None),
            output: output.clone(),
            meta_out: None,
            no_meta: false,
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("selected region is empty"));
        assert!(!output.exists());
    }

    #[test]
    fn prompt_writes_ordered_request() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("upload.png");
        write_fixture_png(&input, 64, 32);
        let out = dir.path().join("request.json");

        command_prompt(PromptArgs {
            source: source(&input, None, None),
            query: query_args("What is 2+2?"),
            out: Some(out.clone()),
        })
        .unwrap();

        let request: ChatRequest = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(request.model, "gpt-test");
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.messages.len(), 2);
        match &request.messages[1] {
            ChatMessage::User { content } => {
                assert_eq!(
                    content[0],
                    ContentPart::Text {
                        text: "What is 2+2?".to_string()
                    }
                );
                assert!(matches!(content[1], ContentPart::ImageUrl { .. }));
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[test]
    fn run_files_share_one_run_id() {
        let files = RunFiles::new(Path::new("root/ask"));
        let image = files.image.file_name().unwrap().to_str().unwrap().to_string();
        let stem = image.trim_end_matches("-image.png");
        assert!(stem.starts_with("ask-"));
        assert_eq!(files.request, Path::new("root/ask").join(format!("{stem}-request.json")));
        assert_eq!(files.answer, Path::new("root/ask").join(format!("{stem}-answer.md")));
        assert_eq!(files.record, Path::new("root/ask").join(format!("{stem}.json")));
    }

    /// Answer one chat-completions POST and hand back the JSON body it carried.
    fn serve_chat_once(status_line: &'static str, body: String) -> (String, thread::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            let mut framing = None;
            loop {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed before the request was complete");
                buf.extend_from_slice(&chunk[..n]);
                if framing.is_none() {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                        let len = head
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        framing = Some((pos + 4, len));
                    }
                }
                if let Some((start, len)) = framing {
                    if buf.len() >= start + len {
                        let response = format!(
                            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        stream.write_all(response.as_bytes()).unwrap();
                        stream.flush().unwrap();
                        return serde_json::from_slice(&buf[start..start + len]).unwrap();
                    }
                }
            }
        });
        (format!("http://{addr}"), handle)
    }

    fn ask_args(source: SourceArgs, base_url: &str, out_dir: &Path) -> AskArgs {
        // The loopback server must not be reached through an ambient HTTP proxy.
        env::set_var("NO_PROXY", "127.0.0.1,localhost");
        AskArgs {
            source,
            query: query_args("Solve for x"),
            api_key: Some("sk-test".to_string()),
            base_url: Some(base_url.to_string()),
            timeout_secs: Some(10),
            save: true,
            out_dir: Some(out_dir.to_path_buf()),
            json: true,
        }
    }

    /// Paths of the single run saved under `dir`, as (image, request, answer, record).
    fn saved_run(dir: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let image_path = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| path.to_string_lossy().ends_with("-image.png"))
            .expect("saved image");
        let name = image_path.file_name().unwrap().to_str().unwrap().to_string();
        let stem = name.trim_end_matches("-image.png");
        (
            image_path.clone(),
            dir.join(format!("{stem}-request.json")),
            dir.join(format!("{stem}-answer.md")),
            dir.join(format!("{stem}.json")),
        )
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn ask_saves_run_files_matching_what_was_sent() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("homework.png");
        write_fixture_png(&input, 400, 200);
        let annotations = dir.path().join("shapes.json");
        fs::write(
            &annotations,
            r#"{"objects": [{"type": "rect", "left": 20, "top": 10, "width": 40, "height": 30}]}"#,
        )
        .unwrap();
        let reply = json!({
            "choices": [{"message": {"role": "assistant", "content": "$x = 2$"}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        let (base_url, server) = serve_chat_once("200 OK", reply.to_string());
        let out_dir = dir.path().join("artifacts");

        command_ask(ask_args(
            source(&input, Some(&annotations), Some(200)),
            &base_url,
            &out_dir,
        ))
        .unwrap();
        let received = server.join().unwrap();

        let (image_path, request, answer, record) = saved_run(&out_dir.join("ask"));
        let sent = image::open(&image_path).unwrap();
        assert_eq!((sent.width(), sent.height()), (40, 30));
        assert_eq!(read_json(&request), received);
        assert_eq!(received["model"], "gpt-test");
        assert_eq!(fs::read_to_string(&answer).unwrap(), "$x = 2$");

        let record = read_json(&record);
        assert_eq!(record["model"], "gpt-test");
        assert_eq!(record["question"], "Solve for x");
        assert_eq!(record["normalized_size"]["width"], 200);
        assert_eq!(record["region"]["left"], 20);
        assert_eq!(record["region"]["top"], 10);
        assert_eq!(record["region"]["right"], 60);
        assert_eq!(record["region"]["bottom"], 40);
        assert_eq!(record["usage"]["total_tokens"], 12);
        assert!(record.get("error").is_none());
    }

    #[test]
    fn ask_failure_leaves_a_record_with_the_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("homework.png");
        write_fixture_png(&input, 64, 32);
        let (base_url, server) =
            serve_chat_once("503 Service Unavailable", r#"{"error":"overloaded"}"#.to_string());
        let out_dir = dir.path().join("artifacts");

        let err = command_ask(ask_args(source(&input, None, None), &base_url, &out_dir)).unwrap_err();
        server.join().unwrap();
        assert!(format!("{err:#}").contains("HTTP 503"));

        let (image_path, request, answer, record) = saved_run(&out_dir.join("ask"));
        assert!(image_path.exists());
        assert!(request.exists());
        assert!(!answer.exists());
        let record = read_json(&record);
        assert!(record["error"].as_str().unwrap().contains("overloaded"));
        assert!(record["region"].is_null());
        assert!(record.get("answer_path").is_none());
    }
}
