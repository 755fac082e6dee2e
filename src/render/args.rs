use std::path::Path;

use crate::render::settings::RenderSettings;

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Map a project and its settings to the renderer's command line.
///
/// The mapping is deterministic: the same inputs always produce the same
/// argument list, in the same order. `log_file` is used when the settings
/// do not name one themselves.
pub fn render_args(project: &Path, settings: &RenderSettings, log_file: Option<&Path>) -> Vec<String> {
    let mut args = vec!["-r".to_string(), project.display().to_string()];

    args.push("-f".to_string());
    args.push(settings.format.cli_name().to_string());

    if let Some(preset) = &settings.preset {
        args.push("-options".to_string());
        args.push(preset.clone());
    }

    if let Some(output) = settings.resolve_output(project) {
        args.push("-o".to_string());
        args.push(output.display().to_string());
    }

    if let Some(start) = settings.start_frame {
        args.push("-start".to_string());
        args.push(start.to_string());
    }
    if let Some(end) = settings.end_frame {
        args.push("-end".to_string());
        args.push(end.to_string());
    }

    if settings.quiet {
        args.push("-q".to_string());
    } else if settings.verbose {
        args.push("-v".to_string());
    }

    if let Some(log) = settings.log_file.as_deref().or(log_file) {
        args.push("-log".to_string());
        args.push(log.display().to_string());
    }

    let flags = [
        ("-multithread", settings.multithread),
        ("-halfsize", settings.half_size),
        ("-halffps", settings.half_fps),
        ("-shapefx", settings.shape_fx),
        ("-layerfx", settings.layer_fx),
        ("-fewparticles", settings.few_particles),
        ("-aa", settings.antialias),
        ("-extrasmooth", settings.extra_smooth),
        ("-premultiply", settings.premultiply),
        ("-ntscsafe", settings.ntsc_safe),
        ("-addformatsuffix", settings.add_format_suffix),
        ("-addlayercompsuffix", settings.add_layer_comp_suffix),
        ("-createfolderforlayercomps", settings.create_folder_for_layer_comps),
    ];
    for (flag, value) in flags {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(yes_no(value).to_string());
        }
    }

    if let Some(comp) = &settings.layer_comp {
        args.push("-layercomp".to_string());
        args.push(comp.cli_value().to_string());
    }

    if let Some(codec) = settings.video_codec {
        args.push("-videocodec".to_string());
        args.push(codec.to_string());
    }

    if let Some(quality) = settings.quality {
        args.push("-quality".to_string());
        args.push(quality.to_string());
    }
    if let Some(depth) = settings.depth {
        args.push("-depth".to_string());
        args.push(depth.to_string());
    }

    args
}
