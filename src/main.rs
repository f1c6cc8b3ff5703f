#![allow(non_snake_case)]
use RustedFields::Examples::vector_field_examples::vector_field_examples;
use RustedFields::Utils::logger::init_logger_from_settings;
use RustedFields::Utils::settings::EvaluationSettings;

fn main() {
    // optional settings file as the first argument, e.g. `cargo run -- fields.toml`
    let settings = match std::env::args().nth(1) {
        Some(path) => EvaluationSettings::from_file(&path).unwrap_or_else(|e| {
            eprintln!("{}; using default settings", e);
            EvaluationSettings::default()
        }),
        None => EvaluationSettings::default(),
    };
    init_logger_from_settings(&settings, None);
    let example = 0;
    match example {
        0 => {
            // run every example in turn
            for i in 0..4 {
                vector_field_examples(i, &settings);
            }
        }
        _ => vector_field_examples(example, &settings),
    }
}
