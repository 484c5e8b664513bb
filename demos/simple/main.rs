use abby::{
    ProjectConfig, ProjectData, PropertyValidator, PropertyValue, RemoteConfigType, StoragePorts,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let project_id = std::env::var("ABBY_PROJECT_ID").unwrap_or_else(|_| "demo".to_owned());
    let mut abby = ProjectConfig::new(project_id)
        .environments(["development", "production"])
        .weighted_test("footer", ["A", "B", "C"], [0.2, 0.5, 0.3])
        .flag("darkMode")
        .remote_config("maxItems", RemoteConfigType::Number)
        .user_property("email", PropertyValidator::string())
        .to_engine(StoragePorts::in_memory());

    abby.subscribe(|data: &ProjectData| println!("Project data changed: {data:?}"));

    // Fetch the snapshot once. Until it arrives (or if it fails), configured defaults are served.
    let data = abby.get_project_data_async().await;
    println!("Initial data: {data:?}");

    let properties = [("email".to_owned(), PropertyValue::from("jane@example.com"))]
        .into_iter()
        .collect();
    if let Err(err) = abby.update_user_properties(properties) {
        eprintln!("{err}");
    }

    println!("Footer variant: {:?}", abby.get_test_variant("footer"));
    println!("Dark mode: {}", abby.get_feature_flag("darkMode"));
    println!("Max items: {:?}", abby.get_remote_config("maxItems"));
}
