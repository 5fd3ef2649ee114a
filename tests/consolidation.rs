use std::{fs, path::Path};

use rcv_fetch::{
    calculate::EFFECT_COLUMN,
    consolidate_ledger,
    ledger::SOURCE_FILE_COLUMN,
    orchestrate::calculate,
    table::{read_xlsx, Cell},
    ConsolidationWarning, LedgerKind,
};
use rust_xlsxwriter::Workbook;

fn write_template(path: &Path, sheet: &str, headers: &[&str]) {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet().set_name(sheet).unwrap();
    for (c, h) in headers.iter().enumerate() {
        worksheet.write_string(0, c as u16, *h).unwrap();
    }
    workbook.save(path).unwrap();
}

#[test]
fn merges_matching_exports_and_skips_foreign_ones() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("Encabezados.xlsx");
    write_template(
        &template,
        "Libro Venta",
        &["Nro", "Tipo Doc", "Razon Social", "Monto Exento", "Monto Neto"],
    );

    let exports = dir.path().join("RCV_Venta");
    fs::create_dir_all(&exports).unwrap();
    fs::write(
        exports.join("a_202401.csv"),
        "Nro;Tipo Doc;Razon Social;Monto Exento;Monto Neto;Extra\n\
         1;33;Comercial Ñuñoa;0;1.500;x\n\
         2;61;Otra;0;500;y\n",
    )
    .unwrap();
    fs::write(exports.join("b_other.csv"), "foo,bar\n1,2\n").unwrap();
    // Windows-1252: 0xE9 is 'é'.
    fs::write(
        exports.join("c_202402.csv"),
        b"Tipo Doc;Razon Social;Monto Exento;Monto Neto\n61;Cr\xe9dito SA;0;1.000\n".as_slice(),
    )
    .unwrap();

    let output = dir.path().join("Consolidado_Venta - 1-9.xlsx");
    let report = consolidate_ledger(&exports, &template, LedgerKind::Sales, &output).unwrap();

    assert_eq!(report.output.as_deref(), Some(output.as_path()));
    assert_eq!(report.rows, 3);
    assert_eq!(report.files, ["a_202401.csv", "c_202402.csv"]);
    assert_eq!(
        report.warnings,
        [ConsolidationWarning::NoMatchingColumns {
            file: "b_other.csv".to_string()
        }]
    );

    let merged = read_xlsx(&output).unwrap();
    assert_eq!(
        merged.columns(),
        [
            "Nro",
            "Tipo Doc",
            "Razon Social",
            "Monto Exento",
            "Monto Neto",
            SOURCE_FILE_COLUMN
        ]
    );
    let source = merged.column_index(SOURCE_FILE_COLUMN).unwrap();
    let sources: Vec<String> = (0..merged.len())
        .map(|r| merged.cell(r, source).as_key())
        .collect();
    assert_eq!(sources, ["a_202401.csv", "a_202401.csv", "c_202402.csv"]);
    assert_eq!(merged.cell(0, 2), &Cell::text("Comercial Ñuñoa"));
    assert_eq!(merged.cell(2, 2), &Cell::text("Crédito SA"));
    assert_eq!(merged.cell(2, 0), &Cell::Empty);
    assert_eq!(merged.cell(0, 4), &Cell::Number(1500.0));

    let calculated = dir.path().join("Calculado_Venta - 1-9.xlsx");
    let rows = calculate(&output, &calculated, &["61".to_string()]).unwrap();
    assert_eq!(rows, 3);

    let table = read_xlsx(&calculated).unwrap();
    let effect = table.column_index(EFFECT_COLUMN).unwrap();
    let effects: Vec<Cell> = (0..table.len()).map(|r| table.cell(r, effect).clone()).collect();
    assert_eq!(
        effects,
        [
            Cell::Number(1500.0),
            Cell::Number(-500.0),
            Cell::Number(-1000.0)
        ]
    );
}

#[test]
fn missing_inputs_only_warn() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.xlsx");

    let report = consolidate_ledger(
        &dir.path().join("RCV_Compra"),
        &dir.path().join("Encabezados.xlsx"),
        LedgerKind::Purchases,
        &output,
    )
    .unwrap();
    assert!(matches!(
        report.warnings.as_slice(),
        [ConsolidationWarning::MissingFolder(_)]
    ));

    let exports = dir.path().join("RCV_Compra");
    fs::create_dir_all(&exports).unwrap();
    let report = consolidate_ledger(
        &exports,
        &dir.path().join("Encabezados.xlsx"),
        LedgerKind::Purchases,
        &output,
    )
    .unwrap();
    assert!(matches!(
        report.warnings.as_slice(),
        [ConsolidationWarning::HeaderTemplate { .. }]
    ));

    let template = dir.path().join("Encabezados.xlsx");
    write_template(&template, "Libro de Compra", &["Tipo Doc", "Monto Neto"]);
    let report = consolidate_ledger(&exports, &template, LedgerKind::Purchases, &output).unwrap();
    assert!(matches!(
        report.warnings.as_slice(),
        [ConsolidationWarning::NoCsvFiles(_)]
    ));

    assert!(report.output.is_none());
    assert!(!output.exists());
}

#[test]
fn unreadable_export_is_skipped_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("Encabezados.xlsx");
    write_template(&template, "Libro Venta", &["Tipo Doc", "Monto Neto"]);
    let exports = dir.path().join("RCV_Venta");
    fs::create_dir_all(&exports).unwrap();
    fs::write(exports.join("bad.csv"), "Tipo Doc;Monto Neto\n33;100;extra\n").unwrap();
    fs::write(exports.join("good.csv"), "Tipo Doc;Monto Neto\n33;100\n").unwrap();

    let output = dir.path().join("out.xlsx");
    let report = consolidate_ledger(&exports, &template, LedgerKind::Sales, &output).unwrap();

    assert_eq!(report.files, ["good.csv"]);
    assert_eq!(report.rows, 1);
    assert!(matches!(
        report.warnings.as_slice(),
        [ConsolidationWarning::UnreadableFile { file, .. }] if file == "bad.csv"
    ));
    assert!(output.exists());
}

#[test]
fn header_only_exports_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("Encabezados.xlsx");
    write_template(&template, "Libro de Compra", &["Tipo Doc", "Monto Neto"]);
    let exports = dir.path().join("RCV_Compra");
    fs::create_dir_all(&exports).unwrap();
    fs::write(exports.join("2024-01.csv"), "Tipo Doc;Monto Neto\n").unwrap();
    fs::write(exports.join("2024-02.csv"), "Tipo Doc;Monto Neto\n").unwrap();

    let output = dir.path().join("out.xlsx");
    let report = consolidate_ledger(&exports, &template, LedgerKind::Purchases, &output).unwrap();

    assert!(matches!(
        report.warnings.as_slice(),
        [ConsolidationWarning::NoValidFiles(path)] if path == &exports
    ));
    assert!(report.output.is_none());
    assert!(!output.exists());
}
