use chrono::NaiveDate;
use formula_dataio::worksheet::Worksheet;
use formula_dataio::{
    CellKind, ColumnMapping, DataIoError, ExcelParser, ExcelWriter, ParseOptions, Record,
    WriterOptions, XlsxPackage,
};
use pretty_assertions::assert_eq;

fn employees() -> Vec<Record> {
    vec![
        Record::new()
            .with("Id", 1)
            .with("Name", "Ann")
            .with("Hired", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        Record::new()
            .with("Id", 2)
            .with("Name", "Bob")
            .with("Hired", NaiveDate::from_ymd_opt(2023, 6, 1).unwrap()),
        Record::new()
            .with("Id", 3)
            .with("Name", "Cy")
            .with("Hired", NaiveDate::from_ymd_opt(2022, 12, 31).unwrap()),
    ]
}

fn sheet_xml(bytes: &[u8], sheet: &str) -> Worksheet {
    let pkg = XlsxPackage::from_bytes(bytes).expect("open output");
    let info = pkg
        .find_sheet(sheet)
        .expect("sheet lookup")
        .expect("sheet exists");
    Worksheet::parse(pkg.part(&info.worksheet_part).expect("worksheet part")).expect("parse")
}

#[test]
fn written_rows_parse_back_with_row_ids() {
    let mut writer = ExcelWriter::new(WriterOptions::default()).expect("writer");
    writer
        .write_sheet("Employees", employees(), &[], false)
        .expect("write");
    let bytes = writer.into_bytes().expect("close");

    let parser = ExcelParser::from_bytes(&bytes, ParseOptions::new("Employees")).expect("parser");
    let headers: Vec<(String, String)> = parser.headers(true).expect("headers").to_pairs();
    assert_eq!(
        headers,
        vec![
            ("A".to_string(), "Id".to_string()),
            ("B".to_string(), "Name".to_string()),
            ("C".to_string(), "Hired".to_string()),
        ]
    );

    let rows: Vec<_> = parser.rows().collect::<Result<_, _>>().expect("rows");
    let ids: Vec<u32> = rows.iter().map(|r| r.row_id()).collect();
    assert_eq!(ids, vec![2, 3, 4]);
    assert_eq!(rows[0].get("id"), Some("1"));
    assert_eq!(rows[1].get("Name"), Some("Bob"));
    assert_eq!(rows[0].get("Hired"), Some("01/15/2024 00:00:00"));
    assert_eq!(rows[2].get("Hired"), Some("12/31/2022 00:00:00"));
}

#[test]
fn quoted_columns_stay_text_and_are_annotated() {
    let mappings = vec![
        ColumnMapping::field("A", "Name", "Name").unwrap(),
        ColumnMapping::field("C", "Code", "Code")
            .unwrap()
            .with_kind(CellKind::Quoted),
    ];
    let rows = vec![
        Record::new().with("Name", "Ann").with("Code", "007"),
        Record::new().with("Name", "Bob").with("Code", "0042"),
    ];

    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Codes", rows, &mappings, false).unwrap();
    let quoted = writer.styles().style_index(CellKind::Quoted, None);
    assert!(quoted > 0);
    assert!(writer.styles().styles().cell_xfs()[quoted as usize].quote_prefix);
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "Codes");
    let sqrefs: Vec<&str> = ws.ignored_errors().iter().map(|e| e.sqref.as_str()).collect();
    assert_eq!(sqrefs, vec!["C1:C65535"]);
    assert!(ws.ignored_errors()[0].flag("numberStoredAsText"));

    let code = ws.row(2).unwrap().cell(3).unwrap();
    assert_eq!(code.data_type(), Some("str"));
    assert_eq!(code.value(), Some("007"));
    assert_eq!(code.style, Some(quoted));
    assert_eq!(ws.row(1).unwrap().cell(3).unwrap().value(), Some("Code"));

    // Nothing was mapped to B.
    assert!(ws.row(2).unwrap().cell(2).is_none());
}

#[test]
fn date_columns_hold_serial_numbers() {
    let mappings = vec![ColumnMapping::field("D", "Start", "Start")
        .unwrap()
        .with_kind(CellKind::Date)
        .with_format_code("yyyy-mm-dd")];
    let rows = vec![Record::new().with("Start", "2024-01-01")];

    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Dates", rows, &mappings, false).unwrap();
    let style = writer.styles().style_index(CellKind::Date, Some("yyyy-mm-dd"));
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "Dates");
    let cell = ws.row(2).unwrap().cell(4).unwrap();
    assert_eq!(cell.data_type(), Some("n"));
    assert_eq!(cell.value(), Some("45292"));
    assert_eq!(cell.style, Some(style));
}

#[test]
fn repeated_writes_reuse_style_entries() {
    let mappings = vec![ColumnMapping::field("A", "Paid", "Paid")
        .unwrap()
        .with_kind(CellKind::Currency)];
    let rows = || vec![Record::new().with("Paid", 12.5), Record::new().with("Paid", 3.0)];

    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("One", rows(), &mappings, false).unwrap();
    let xfs = writer.styles().styles().cell_xfs().len();
    let fmts = writer.styles().styles().num_fmts().len();
    writer.write_sheet("Two", rows(), &mappings, false).unwrap();
    assert_eq!(writer.styles().styles().cell_xfs().len(), xfs);
    assert_eq!(writer.styles().styles().num_fmts().len(), fmts);
}

#[test]
fn letter_mappings_win_over_header_mappings_and_fields() {
    let mappings = vec![
        ColumnMapping::new("B", "Display", |row| {
            row.get("Name").map(|v| format!("<{}>", v.to_text()).into())
        })
        .unwrap(),
        ColumnMapping::for_header("Name", |_| Some("ignored".into())),
    ];
    let rows = vec![Record::new().with("Id", 1).with("Name", "Ann")];
    let options = WriterOptions::default().with_generate_headers_from_row_shape(true);

    let mut writer = ExcelWriter::new(options).unwrap();
    writer.write_sheet("People", rows, &mappings, false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "People");
    let header = ws.row(1).unwrap();
    assert_eq!(header.cell(1).unwrap().value(), Some("Id"));
    // An existing header cell is only rewritten when the mapping asks for it.
    assert_eq!(header.cell(2).unwrap().value(), Some("Name"));

    let data = ws.row(2).unwrap();
    assert_eq!(data.cell(1).unwrap().value(), Some("1"));
    assert_eq!(data.cell(2).unwrap().value(), Some("<Ann>"));
}

#[test]
fn update_header_rewrites_existing_header_text() {
    let mappings = vec![ColumnMapping::field("B", "Full Name", "Name")
        .unwrap()
        .with_update_header(true)];
    let rows = vec![Record::new().with("Id", 1).with("Name", "Ann")];
    let options = WriterOptions::default().with_generate_headers_from_row_shape(true);

    let mut writer = ExcelWriter::new(options).unwrap();
    writer.write_sheet("People", rows, &mappings, false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "People");
    assert_eq!(ws.row(1).unwrap().cell(2).unwrap().value(), Some("Full Name"));
    assert_eq!(ws.row(2).unwrap().cell(2).unwrap().value(), Some("Ann"));
}

#[test]
fn headerless_writes_start_at_the_data_row() {
    let options = WriterOptions::default().with_rows(0, 1);
    let mut writer = ExcelWriter::new(options).unwrap();
    writer.write_sheet("Raw", employees(), &[], false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "Raw");
    let indexes: Vec<u32> = ws.rows().iter().map(|r| r.index()).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
    assert_eq!(ws.row(1).unwrap().cell(2).unwrap().value(), Some("Ann"));
}

#[test]
fn rows_and_cells_stay_in_order_after_mixed_writes() {
    let mappings = vec![
        ColumnMapping::field("E", "Late", "Late").unwrap(),
        ColumnMapping::field("A", "Early", "Early").unwrap(),
    ];
    let rows = vec![Record::new().with("Early", "a").with("Late", "e")];

    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Order", rows.clone(), &mappings, false).unwrap();
    writer.write_sheet("Order", rows, &mappings, true).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let ws = sheet_xml(&bytes, "Order");
    let indexes: Vec<u32> = ws.rows().iter().map(|r| r.index()).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
    for row in ws.rows() {
        let cols: Vec<u32> = row.cells().iter().map(|c| c.col()).collect();
        assert!(cols.windows(2).all(|w| w[0] < w[1]), "{cols:?}");
    }
}

#[test]
fn new_sheets_get_sequential_ids_and_name_limits() {
    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Alpha", employees(), &[], false).unwrap();
    writer.write_sheet("Beta", employees(), &[], false).unwrap();

    let thirty = "x".repeat(30);
    writer.write_sheet(&thirty, employees(), &[], false).unwrap();
    let err = writer
        .write_sheet(&"y".repeat(31), employees(), &[], false)
        .unwrap_err();
    assert!(matches!(err, DataIoError::SheetNameTooLong(_)));

    let bytes = writer.into_bytes().unwrap();
    let pkg = XlsxPackage::from_bytes(&bytes).unwrap();
    let ids: Vec<(String, u32)> = pkg
        .workbook_sheets()
        .unwrap()
        .into_iter()
        .map(|s| (s.name, s.sheet_id))
        .collect();
    assert_eq!(
        ids,
        vec![
            ("Alpha".to_string(), 1),
            ("Beta".to_string(), 2),
            (thirty, 3)
        ]
    );
}

#[test]
fn writes_to_nested_paths() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("out/nested/employees.xlsx");

    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Employees", employees(), &[], false).unwrap();
    writer.write_to_path(&path).expect("write");
    assert!(path.is_file());

    let parser = ExcelParser::open(&path, ParseOptions::new("Employees")).unwrap();
    assert!(parser.has_data_rows().unwrap());
    assert_eq!(parser.rows().count(), 3);

    assert!(matches!(
        writer.write_sheet("Again", employees(), &[], false),
        Err(DataIoError::WriterClosed)
    ));
}

#[test]
fn written_style_sheet_counts_match_its_entries() {
    let mappings = vec![
        ColumnMapping::field("A", "Rate", "Rate")
            .unwrap()
            .with_kind(CellKind::Percent)
            .with_format_code("0.0%"),
        ColumnMapping::field("B", "Code", "Code")
            .unwrap()
            .with_kind(CellKind::Quoted),
    ];
    let rows = vec![Record::new().with("Rate", 0.25).with("Code", "01")];
    let mut writer = ExcelWriter::new(WriterOptions::default()).unwrap();
    writer.write_sheet("Rates", rows, &mappings, false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let pkg = XlsxPackage::from_bytes(&bytes).unwrap();
    let xml = std::str::from_utf8(pkg.part("xl/styles.xml").unwrap()).unwrap();
    let doc = roxmltree::Document::parse(xml).unwrap();
    for block in ["numFmts", "cellXfs"] {
        let node = doc
            .descendants()
            .find(|n| n.has_tag_name(block))
            .unwrap_or_else(|| panic!("missing <{block}>"));
        let children = node.children().filter(|n| n.is_element()).count();
        assert_eq!(node.attribute("count"), Some(children.to_string().as_str()));
    }
    assert!(doc
        .descendants()
        .any(|n| n.has_tag_name("numFmt") && n.attribute("formatCode") == Some("0.0%")));
    assert!(doc
        .descendants()
        .any(|n| n.has_tag_name("xf") && n.attribute("quotePrefix") == Some("1")));
}
