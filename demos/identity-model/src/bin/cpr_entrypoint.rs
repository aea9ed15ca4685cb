// Generated by localmodel. Delete this file to regenerate it.

fn main() -> std::process::ExitCode {
    modelserver::launch(identity_model::IdentityPredictor::default, modelserver::DefaultHandler::new)
}
