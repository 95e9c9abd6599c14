use formula_dataio::worksheet::Worksheet;
use formula_dataio::{
    list_sheet_names, ColumnMapping, DataIoError, ExcelParser, ExcelWriter, ParseOptions, Record,
    WriterOptions, XlsxPackage,
};
use pretty_assertions::assert_eq;
use rust_xlsxwriter::{Format, Workbook};

/// `Data` holds a styled header row and three data rows; `Archive` is hidden.
fn build_template() -> Vec<u8> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let date = Format::new().set_num_format("yyyy-mm-dd");

    let data = workbook.add_worksheet();
    data.set_name("Data").unwrap();
    data.write_string_with_format(0, 0, "Id", &bold).unwrap();
    data.write_string_with_format(0, 1, "Full Name!", &bold).unwrap();
    data.write_string_with_format(0, 2, "Start", &bold).unwrap();
    for (i, name) in ["Ann", "Bob", "Cy"].into_iter().enumerate() {
        let row = i as u32 + 1;
        data.write_number(row, 0, row as f64).unwrap();
        data.write_string(row, 1, name).unwrap();
        data.write_number_with_format(row, 2, 45306.0 + row as f64, &date)
            .unwrap();
    }

    let archive = workbook.add_worksheet();
    archive.set_name("Archive").unwrap();
    archive.write_string(0, 0, "Old").unwrap();
    archive.set_hidden(true);

    workbook.save_to_buffer().unwrap()
}

fn data_rows(bytes: &[u8]) -> Vec<(u32, Vec<(String, String)>)> {
    let parser = ExcelParser::from_bytes(bytes, ParseOptions::new("Data")).unwrap();
    parser
        .rows()
        .map(|row| row.map(|r| (r.row_id(), r.into_fields())))
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn parses_template_rows_with_fixed_up_headers_and_dates() {
    let rows = data_rows(&build_template());
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0],
        (
            2,
            vec![
                ("Id".to_string(), "1".to_string()),
                ("FullName".to_string(), "Ann".to_string()),
                ("Start".to_string(), "01/16/2024 00:00:00".to_string()),
            ]
        )
    );
    assert_eq!(rows[2].0, 4);
}

#[test]
fn raw_headers_keep_their_punctuation() {
    let parser = ExcelParser::from_bytes(&build_template(), ParseOptions::new("data")).unwrap();
    assert_eq!(parser.headers(false).unwrap().name("B"), Some("Full Name!"));
    assert_eq!(parser.headers(true).unwrap().name("b"), Some("FullName"));
}

#[test]
fn blank_rows_are_suppressed() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Sparse").unwrap();
    sheet.write_string(0, 0, "Value").unwrap();
    sheet.write_string(1, 0, "first").unwrap();
    sheet.write_string(2, 0, "   ").unwrap();
    sheet.write_string(4, 0, "last").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let parser = ExcelParser::from_bytes(&bytes, ParseOptions::new("Sparse")).unwrap();
    let ids: Vec<u32> = parser.rows().map(|r| r.unwrap().row_id()).collect();
    assert_eq!(ids, vec![2, 5]);
}

#[test]
fn hidden_sheets_are_listed_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("template.xlsx");
    std::fs::write(&path, build_template()).unwrap();

    assert_eq!(list_sheet_names(&path, false).unwrap(), vec!["Data"]);
    assert_eq!(
        list_sheet_names(&path, true).unwrap(),
        vec!["Data", "Archive"]
    );
    assert!(matches!(
        list_sheet_names("", true),
        Err(DataIoError::EmptySourcePath)
    ));
}

#[test]
fn templates_do_not_create_missing_sheets_by_default() {
    let mut writer = ExcelWriter::from_template_bytes(&build_template(), WriterOptions::default())
        .unwrap();
    let err = writer
        .write_sheet("Missing", vec![Record::new().with("Id", 1)], &[], false)
        .unwrap_err();
    assert!(matches!(err, DataIoError::SheetNotFound(name) if name == "Missing"));
}

#[test]
fn clearing_replaces_existing_data_rows() {
    let mut writer =
        ExcelWriter::from_template_bytes(&build_template(), WriterOptions::default()).unwrap();
    let rows = vec![Record::new().with("Id", 9).with("FullName", "Zed")];
    writer.write_sheet("Data", rows, &[], false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let rows = data_rows(&bytes);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].1,
        vec![
            ("Id".to_string(), "9".to_string()),
            ("FullName".to_string(), "Zed".to_string()),
            ("Start".to_string(), String::new()),
        ]
    );
}

#[test]
fn without_clearing_only_written_cells_change() {
    let options = WriterOptions::default().with_clear_sheet_data_before_write(false);
    let mut writer = ExcelWriter::from_template_bytes(&build_template(), options).unwrap();
    let rows = vec![Record::new().with("FullName", "Zed")];
    writer.write_sheet("Data", rows, &[], false).unwrap();
    let bytes = writer.into_bytes().unwrap();

    let rows = data_rows(&bytes);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].1[0], ("Id".to_string(), "1".to_string()));
    assert_eq!(rows[0].1[1], ("FullName".to_string(), "Zed".to_string()));
    assert_eq!(rows[1].1[1], ("FullName".to_string(), "Bob".to_string()));
}

#[test]
fn appending_to_a_template_resumes_after_its_data() {
    let mut writer =
        ExcelWriter::from_template_bytes(&build_template(), WriterOptions::default()).unwrap();
    writer
        .write_sheet("Data", vec![Record::new().with("Id", 4)], &[], true)
        .unwrap();
    writer
        .write_sheet("Data", vec![Record::new().with("Id", 5)], &[], true)
        .unwrap();
    let bytes = writer.into_bytes().unwrap();

    let ids: Vec<(u32, String)> = data_rows(&bytes)
        .into_iter()
        .map(|(row_id, fields)| (row_id, fields[0].1.clone()))
        .collect();
    assert_eq!(
        ids,
        vec![
            (2, "1".to_string()),
            (3, "2".to_string()),
            (4, "3".to_string()),
            (5, "4".to_string()),
            (6, "5".to_string()),
        ]
    );
}

#[test]
fn new_header_cells_inherit_the_header_style() {
    let mappings = vec![ColumnMapping::field("E", "Team", "Team").unwrap()];
    let mut writer =
        ExcelWriter::from_template_bytes(&build_template(), WriterOptions::default()).unwrap();
    writer
        .write_sheet("Data", vec![Record::new().with("Team", "Red")], &mappings, false)
        .unwrap();
    let bytes = writer.into_bytes().unwrap();

    let pkg = XlsxPackage::from_bytes(&bytes).unwrap();
    let part = pkg.find_sheet("Data").unwrap().unwrap().worksheet_part;
    let ws = Worksheet::parse(pkg.part(&part).unwrap()).unwrap();
    let header = ws.row(1).unwrap();
    let team = header.cell(5).unwrap();
    assert_eq!(team.value(), Some("Team"));
    assert_eq!(team.style, header.cell(3).unwrap().style);
    assert_eq!(ws.row(2).unwrap().cell(5).unwrap().value(), Some("Red"));
}

#[test]
fn the_template_file_is_left_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template.xlsx");
    let original = build_template();
    std::fs::write(&template, &original).unwrap();

    let mut writer = ExcelWriter::from_template(&template, WriterOptions::default()).unwrap();
    writer
        .write_sheet("Data", vec![Record::new().with("Id", 7)], &[], false)
        .unwrap();
    writer.write_to_path(dir.path().join("out.xlsx")).unwrap();

    assert_eq!(std::fs::read(&template).unwrap(), original);
}
