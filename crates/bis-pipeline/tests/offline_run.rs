use std::path::Path;

use bis_core::text_cells;
use bis_pipeline::{Pipeline, PipelineConfig, SourceRole};
use bis_storage::read_frame_csv;
use polars::prelude::DataFrame;

const SOURCES_YAML: &str = r#"
sources:
  - source_id: building_footprints
    role: footprints
    kind: odata
    endpoint:
      url: https://example.invalid/api/odata/v4/footprints
      select: bin,base_bbl
    backup_csv: raw/footprints.csv
    schema:
      bin: bin
      bbl:
        column: base_bbl
  - source_id: pluto
    role: parcels
    kind: csv
    path: raw/pluto.csv
    schema:
      bbl:
        column: BBL
  - source_id: dob_permits
    role: permits
    kind: socrata
    endpoint:
      url: https://example.invalid/resource/permits.json
    backup_csv: raw/permits.csv
    schema:
      bin: bin__
  - source_id: rolling_sales
    role: sales
    kind: csv
    path: raw/sales.csv
    schema:
      bbl:
        borough: borough
        block: block
        lot: lot
"#;

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

fn seed_workspace(root: &Path) {
    write(root, "sources.yaml", SOURCES_YAML);
    write(
        root,
        "raw/footprints.csv",
        "bin,base_bbl\n1000001,1000010001\n1000002,1000010002.0\n1000000,1000010003\n",
    );
    write(
        root,
        "raw/pluto.csv",
        "BBL,Address,zonedist1\n1000010001,123 Test St,R6\n1000010002,9 Other Ave,C4-2\n",
    );
    write(
        root,
        "raw/permits.csv",
        "bin__,job__,issuance_date\n1000001,J1,2023-06-01\n1000001,J0,2023-02-01\n",
    );
    write(
        root,
        "raw/sales.csv",
        "borough,block,lot,sale_date,sale_price\nMANHATTAN,1,1,2023-01-01,500000\n1,1,2,2024-02-01,\"2,500,000\"\n",
    );
}

fn value(frame: &DataFrame, row: usize, column: &str) -> Option<String> {
    text_cells(frame, column).unwrap()[row].clone()
}

fn offline_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::for_workspace(root);
    config.offline = true;
    config
}

#[tokio::test]
async fn offline_run_writes_master_reports_and_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let pipeline = Pipeline::new(offline_config(dir.path())).unwrap();

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.master_rows, 2);

    let master = read_frame_csv(&pipeline.config().master_path()).await.unwrap();
    assert_eq!(master.height(), 2);
    assert_eq!(&master.get_column_names()[..2], &["BIN", "BBL"]);
    assert_eq!(value(&master, 0, "BIN").as_deref(), Some("1000001"));
    assert_eq!(value(&master, 0, "Address").as_deref(), Some("123 Test St"));
    assert_eq!(value(&master, 0, "all_permits").as_deref(), Some("J0;J1"));
    assert_eq!(value(&master, 0, "issuance_date").as_deref(), Some("2023-06-01"));
    assert_eq!(value(&master, 0, "days_to_permit").as_deref(), Some("151"));
    assert_eq!(value(&master, 0, "renovation_after_sale").as_deref(), Some("true"));
    assert_eq!(value(&master, 1, "BBL").as_deref(), Some("1000010002"));
    assert_eq!(value(&master, 1, "sale_date").as_deref(), Some("2024-02-01"));
    assert_eq!(value(&master, 1, "days_to_permit"), None);
    assert_eq!(value(&master, 1, "off_market_candidate").as_deref(), Some("true"));

    let reports_dir = Path::new(&summary.reports_dir);
    assert!(reports_dir.join("run_summary.md").is_file());
    assert!(reports_dir.join("run.json").is_file());
    assert!(reports_dir.join("snapshots/master.parquet").is_file());
    assert!(Path::new(&summary.parquet_manifest).is_file());

    let summary_md = std::fs::read_to_string(reports_dir.join("run_summary.md")).unwrap();
    assert_eq!(summary.status, "completed");
    assert!(summary_md.contains("- Status: completed"));
    assert!(!summary_md.contains("TRUNCATED"));
    assert!(summary_md.contains("building_footprints (footprints, Odata, backup): 3 raw rows, 2 kept, 1 bad BIN"));

    let record: bis_pipeline::RunRecord =
        serde_json::from_slice(&std::fs::read(reports_dir.join("run.json")).unwrap()).unwrap();
    assert_eq!(record.sources.len(), 4);
    assert_eq!(record.sources[0].role, SourceRole::Footprints);
    assert!(record.sources.iter().all(|s| s.stored_artifacts == 0));
    assert_eq!(record.renovation.total_sales, 2);
    assert_eq!(record.renovation.renovated_within_window, 1);

    let (leads_path, leads) = pipeline.write_top_leads(None).await.unwrap();
    assert_eq!(leads, 1);
    let top = read_frame_csv(&leads_path).await.unwrap();
    assert_eq!(value(&top, 0, "BIN").as_deref(), Some("1000002"));
    assert_eq!(value(&top, 0, "lead_score").as_deref(), Some("3"));

    let renovation = pipeline.renovation_report().await.unwrap();
    assert!((renovation.pct_renovated - 50.0).abs() < f64::EPSILON);
    assert_eq!(renovation.median_days_to_permit, Some(151.0));
}

#[tokio::test]
async fn fetch_writes_one_normalized_source() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let pipeline = Pipeline::new(offline_config(dir.path())).unwrap();

    let (path, stats) = pipeline.fetch_source("rolling_sales").await.unwrap();
    assert_eq!(path, dir.path().join("data/processed/rolling_sales.csv"));
    assert_eq!(stats.normalize.output_rows, 2);
    let sales = read_frame_csv(&path).await.unwrap();
    assert_eq!(sales.get_column_names()[0], "BBL");
    assert_eq!(value(&sales, 0, "BBL").as_deref(), Some("1000010001"));
    assert_eq!(value(&sales, 1, "BBL").as_deref(), Some("1000010002"));
}

#[tokio::test]
async fn broken_source_leaves_previous_master_untouched() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let pipeline = Pipeline::new(offline_config(dir.path())).unwrap();
    pipeline.run_once().await.unwrap();
    let before = std::fs::read(pipeline.config().master_path()).unwrap();

    // renamed upstream column: the mapped BIN column no longer exists
    write(dir.path(), "raw/permits.csv", "bin_number,job__\n1000001,J9\n");
    let err = pipeline.run_once().await.unwrap_err();
    assert!(format!("{err:#}").contains("bin__"));

    let after = std::fs::read(pipeline.config().master_path()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn fetched_output_serves_as_the_backup_csv() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let pipeline = Pipeline::new(offline_config(dir.path())).unwrap();

    for (source_id, backup) in [
        ("building_footprints", "raw/footprints.csv"),
        ("dob_permits", "raw/permits.csv"),
    ] {
        let (path, first_stats) = pipeline.fetch_source(source_id).await.unwrap();
        let first = read_frame_csv(&path).await.unwrap();
        std::fs::copy(&path, dir.path().join(backup)).unwrap();

        // the canonical BIN/BBL header stands in for the mapped raw column
        let (path, second_stats) = pipeline.fetch_source(source_id).await.unwrap();
        let second = read_frame_csv(&path).await.unwrap();
        assert!(first.equals_missing(&second), "{source_id} changed on reload");
        assert_eq!(second_stats.normalize.output_rows, first_stats.normalize.output_rows);
        assert_eq!(second_stats.normalize.rejected(), 0);
    }

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.master_rows, 2);
    let master = read_frame_csv(&pipeline.config().master_path()).await.unwrap();
    assert_eq!(value(&master, 0, "all_permits").as_deref(), Some("J0;J1"));
}

#[tokio::test]
async fn renamed_sale_headers_feed_the_master() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let yaml = SOURCES_YAML.replace(
        "    path: raw/sales.csv\n",
        "    path: raw/sales.csv\n    rename:\n      SALE DATE: sale_date\n      SALE PRICE: sale_price\n",
    );
    write(dir.path(), "sources.yaml", &yaml);
    write(
        dir.path(),
        "raw/sales.csv",
        "borough,block,lot,SALE DATE,SALE PRICE\n1,1,1,2023-01-01,500000\n",
    );
    let pipeline = Pipeline::new(offline_config(dir.path())).unwrap();

    pipeline.run_once().await.unwrap();
    let master = read_frame_csv(&pipeline.config().master_path()).await.unwrap();
    assert!(!master.get_column_names().contains(&"SALE DATE"));
    assert_eq!(value(&master, 0, "sale_date").as_deref(), Some("2023-01-01"));
    assert_eq!(value(&master, 0, "days_to_permit").as_deref(), Some("151"));
}
