use aqi_service::{
    build_feature_schema, engineer_features, FeatureConfig, FeatureRow, FeatureTable, LabeledRow,
    Pollutant, POLLUTANT_COUNT,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 3, 0, 0, 0).single().unwrap()
}

fn labeled(region: &str, hour: i64, no2: Option<f64>, aqi: Option<f64>) -> LabeledRow {
    let mut values = [None; POLLUTANT_COUNT];
    values[Pollutant::No2.index()] = no2;
    LabeledRow {
        region: region.to_string(),
        utc: Some(t0() + Duration::hours(hour)),
        values,
        aqi,
    }
}

fn value(table: &FeatureTable, row: &FeatureRow, column: &str) -> Option<f64> {
    let idx = table
        .schema
        .column_index(column)
        .unwrap_or_else(|| panic!("missing column {column}"));
    row.values[idx]
}

fn rows_for<'a>(table: &'a FeatureTable, region: &str) -> Vec<&'a FeatureRow> {
    table.rows.iter().filter(|r| r.region == region).collect()
}

#[test]
fn lags_rolling_stats_and_calendar_fields_for_one_region() {
    let input: Vec<LabeledRow> = (0..30)
        .map(|i| labeled("California", i, Some((i + 1) as f64), Some(10.0 * (i + 1) as f64)))
        .collect();

    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    assert_eq!(table.rows.len(), 30);

    let last = table.latest().unwrap();
    assert_eq!(last.utc, t0() + Duration::hours(29));
    assert_eq!(value(&table, last, "year"), Some(2025.0));
    assert_eq!(value(&table, last, "month"), Some(10.0));
    assert_eq!(value(&table, last, "day"), Some(4.0));
    assert_eq!(value(&table, last, "hour"), Some(5.0));
    assert_eq!(value(&table, last, "value_no2"), Some(30.0));
    assert_eq!(value(&table, last, "value_no2_lag6"), Some(24.0));
    assert_eq!(value(&table, last, "value_no2_lag24"), Some(6.0));
    assert_eq!(value(&table, last, "value_no2_rollmean3"), Some(29.0));
    assert_eq!(value(&table, last, "value_no2_rollstd3"), Some(1.0));
    assert_eq!(value(&table, last, "value_no2_rollmean24"), Some(18.5));
    assert_eq!(value(&table, last, "aqi"), Some(300.0));
    assert_eq!(value(&table, last, "aqi_lag6"), Some(240.0));
}

#[test]
fn early_rows_are_filled_with_group_median() {
    let input: Vec<LabeledRow> = (0..30)
        .map(|i| labeled("California", i, Some((i + 1) as f64), Some(1.0)))
        .collect();
    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    let first = &table.rows[0];

    // lag6 exists for rows 6..30 with values 1..24.
    assert_eq!(value(&table, first, "value_no2_lag6"), Some(12.5));
    // One observation gives no sample std; later windows are mostly 1.0.
    assert_eq!(value(&table, first, "value_no2_rollstd3"), Some(1.0));
}

#[test]
fn rolling_mean_uses_available_points_only() {
    let input = vec![
        labeled("Nevada", 0, Some(10.0), Some(1.0)),
        labeled("Nevada", 1, None, Some(1.0)),
        labeled("Nevada", 2, Some(30.0), Some(1.0)),
    ];
    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();

    assert_eq!(value(&table, &table.rows[0], "value_no2_rollmean3"), Some(10.0));
    assert_eq!(value(&table, &table.rows[1], "value_no2_rollmean3"), Some(10.0));
    assert_eq!(value(&table, &table.rows[2], "value_no2_rollmean3"), Some(20.0));
    // The gap itself is imputed with the median of 10 and 30.
    assert_eq!(value(&table, &table.rows[1], "value_no2"), Some(20.0));
}

#[test]
fn regions_do_not_leak_into_each_other() {
    let mut input = Vec::new();
    for i in 0..10 {
        input.push(labeled("A", i, Some(100.0 + i as f64), Some(50.0)));
        if i < 3 {
            input.push(labeled("B", i, Some(i as f64), Some(5.0)));
        }
    }
    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    assert_eq!(table.report.region_groups, 2);

    let a = rows_for(&table, "A");
    assert_eq!(a.len(), 10);
    assert_eq!(value(&table, a[6], "value_no2_lag6"), Some(100.0));
    assert_eq!(value(&table, a[9], "value_no2_rollmean3"), Some(108.0));

    // Three rows are too few for any lag; the whole column stays missing.
    let b = rows_for(&table, "B");
    assert_eq!(b.len(), 3);
    for row in &b {
        assert_eq!(value(&table, row, "value_no2_lag6"), None);
        assert_eq!(value(&table, row, "aqi_lag6"), None);
    }
    assert!(table.report.unfilled_cells > 0);
}

#[test]
fn untimed_rows_are_dropped_and_do_not_shift_lags() {
    let mut input: Vec<LabeledRow> = (0..8)
        .map(|i| labeled("A", i, Some(i as f64), Some(1.0)))
        .collect();
    input.insert(
        3,
        LabeledRow {
            region: "A".to_string(),
            utc: None,
            values: [Some(999.0); POLLUTANT_COUNT],
            aqi: Some(999.0),
        },
    );

    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    assert_eq!(table.report.input_rows, 9);
    assert_eq!(table.report.dropped_untimed_rows, 1);
    assert_eq!(table.rows.len(), 8);
    let last = table.latest().unwrap();
    assert_eq!(value(&table, last, "value_no2_lag6"), Some(1.0));
    assert!(table.rows.iter().all(|r| r.values.iter().flatten().all(|v| *v < 999.0)));
}

#[test]
fn pollutants_without_any_data_stay_missing() {
    let input: Vec<LabeledRow> = (0..5)
        .map(|i| labeled("A", i, Some(1.0), Some(1.0)))
        .collect();
    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    for row in &table.rows {
        assert_eq!(value(&table, row, "value_pm10"), None);
        assert_eq!(value(&table, row, "value_so2_rollmean3"), None);
    }
}

#[test]
fn empty_input_gives_empty_table_with_schema() {
    let table = engineer_features(&[], &FeatureConfig::default()).unwrap();
    assert!(table.rows.is_empty());
    assert!(table.latest().is_none());
    assert_eq!(table.schema, build_feature_schema(&FeatureConfig::default()));
}

#[test]
fn fingerprint_tracks_the_column_set() {
    let default = build_feature_schema(&FeatureConfig::default());
    let narrower = build_feature_schema(&FeatureConfig {
        rolling_windows: vec![3],
        ..FeatureConfig::default()
    });
    assert_ne!(default.fingerprint, narrower.fingerprint);
    assert!(narrower.column_index("value_no2_rollmean24").is_none());
    assert_eq!(
        default.fingerprint,
        build_feature_schema(&FeatureConfig::default()).fingerprint
    );
}

#[test]
fn select_picks_named_columns_in_order() {
    let input: Vec<LabeledRow> = (0..8)
        .map(|i| labeled("A", i, Some(i as f64), Some(2.0 * i as f64)))
        .collect();
    let table = engineer_features(&input, &FeatureConfig::default()).unwrap();
    let last = table.latest().unwrap();

    let names = vec!["aqi_lag6".to_string(), "hour".to_string(), "value_no2".to_string()];
    assert_eq!(
        table.schema.select(last, &names).unwrap(),
        vec![Some(2.0), Some(7.0), Some(7.0)]
    );
    assert!(table
        .schema
        .select(last, &["City_encoded".to_string()])
        .is_err());
    // No PM2.5 readings at all: the gap is passed through, not an error.
    assert_eq!(
        table
            .schema
            .select(last, &["value_pm25".to_string()])
            .unwrap(),
        vec![None]
    );
}
